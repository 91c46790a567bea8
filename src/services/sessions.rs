//! Session operations, including background title generation.

use anyhow::Result;
use serde_json::json;
use tracing::warn;

use crate::ai::ChatClient;
use crate::cache::Session;

use super::Services;

const TITLE_PROMPT: &str = "Generate a short title (at most 6 words, no quotes) for a chat that \
starts with the following exchange. Respond with JSON: {\"title\": \"...\"}.\n\nUser: {user}\n\nAssistant: {assistant}";

impl Services {
    pub fn get_sessions(&self, user_id: i64, persona_name: &str) -> Vec<Session> {
        self.cache.get_sessions(user_id, persona_name)
    }

    pub fn get_current_session(&self, user_id: i64, persona_name: &str) -> Option<Session> {
        let id = self.cache.get_current_session_id(user_id, persona_name)?;
        self.cache.get_session_by_id(id)
    }

    pub fn get_current_session_id(&self, user_id: i64, persona_name: &str) -> Option<i64> {
        self.cache.get_current_session_id(user_id, persona_name)
    }

    /// Current session for the persona, created on demand.
    pub fn ensure_session(&self, user_id: i64, persona_name: &str) -> i64 {
        self.cache.ensure_session_id(user_id, persona_name)
    }

    /// Create a session and switch to it.
    pub fn create_session(&self, user_id: i64, persona_name: &str, title: Option<String>) -> Session {
        let session = self.cache.create_session(user_id, persona_name, title);
        self.cache.set_current_session_id(user_id, persona_name, session.id);
        session
    }

    /// Switch by 1-based index into the persona's session list.
    pub fn switch_session(&self, user_id: i64, persona_name: &str, index: usize) -> Option<Session> {
        let sessions = self.cache.get_sessions(user_id, persona_name);
        if index == 0 || index > sessions.len() {
            return None;
        }
        let session = sessions[index - 1].clone();
        self.cache.set_current_session_id(user_id, persona_name, session.id);
        Some(session)
    }

    /// Rename the current session.
    pub fn rename_session(&self, user_id: i64, persona_name: &str, title: &str) -> bool {
        match self.cache.get_current_session_id(user_id, persona_name) {
            Some(id) => self.cache.update_session_title(id, title),
            None => false,
        }
    }

    /// Delete by 1-based index. When the current session goes away, the most
    /// recent remaining one becomes current (or a fresh one is created).
    pub fn delete_session(&self, user_id: i64, persona_name: &str, index: usize) -> Option<Session> {
        let sessions = self.cache.get_sessions(user_id, persona_name);
        if index == 0 || index > sessions.len() {
            return None;
        }
        let session = sessions[index - 1].clone();
        let current = self.cache.get_current_session_id(user_id, persona_name);
        if !self.cache.delete_session(user_id, persona_name, session.id) {
            return None;
        }
        if current == Some(session.id) {
            if let Some(last) = self.cache.get_sessions(user_id, persona_name).last() {
                self.cache.set_current_session_id(user_id, persona_name, last.id);
            } else {
                let fresh = self.cache.create_session(user_id, persona_name, None);
                self.cache.set_current_session_id(user_id, persona_name, fresh.id);
            }
        }
        Some(session)
    }

    pub fn session_message_count(&self, session_id: i64) -> usize {
        self.cache.session_message_count(session_id)
    }

    pub fn set_session_title(&self, session_id: i64, title: &str) -> bool {
        self.cache.update_session_title(session_id, title)
    }

    /// Ask the model for a session title after the first exchange.
    ///
    /// `title_model` may be "model" or "provider:model" where the provider
    /// names a saved preset. Failures never block the turn; the caller runs
    /// this as a detached task.
    pub async fn generate_session_title(
        &self,
        user_id: i64,
        user_message: &str,
        ai_response: &str,
    ) -> Result<Option<String>> {
        let settings = self.get_user_settings(user_id);
        let mut api_key = settings.api_key.clone();
        let mut base_url = settings.base_url.clone();
        let mut model = settings.model.clone();

        let raw = settings.title_model.trim();
        if !raw.is_empty() {
            if let Some((provider, model_name)) = raw.split_once(':') {
                let Some(preset) = self.find_provider(user_id, provider) else {
                    warn!(user_id, provider, "title model provider not found in presets");
                    return Ok(None);
                };
                api_key = preset.api_key;
                base_url = preset.base_url;
                model = if model_name.is_empty() { preset.model } else { model_name.to_string() };
            } else {
                model = raw.to_string();
            }
        }

        let prompt = TITLE_PROMPT
            .replace("{user}", truncated(user_message, 500))
            .replace("{assistant}", truncated(ai_response, 500));
        let client = ChatClient::new(&api_key, &base_url);
        let chunk = client
            .chat(&[json!({ "role": "user", "content": prompt })], &model, 0.3)
            .await?;
        let Some(text) = chunk.content else { return Ok(None) };
        Ok(parse_title(&text))
    }
}

fn truncated(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn parse_title(raw: &str) -> Option<String> {
    let mut text = raw.trim().to_string();
    if text.starts_with("```") {
        let lines: Vec<&str> = text.lines().collect();
        let body = if lines.last().map(|l| l.trim() == "```").unwrap_or(false) {
            &lines[1..lines.len() - 1]
        } else {
            &lines[1..]
        };
        text = body.join("\n").trim().to_string();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
        match value {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    if k.eq_ignore_ascii_case("title") {
                        if let Some(title) = v.as_str() {
                            let title = title.trim();
                            if !title.is_empty() {
                                return Some(title.to_string());
                            }
                        }
                    }
                }
            }
            serde_json::Value::String(s) => {
                let s = s.trim().to_string();
                if !s.is_empty() && s.chars().count() < 50 {
                    return Some(s);
                }
            }
            _ => {}
        }
    }

    let title = text.trim_matches(['"', '\'']).trim();
    if !title.is_empty() && title.chars().count() < 50 && !title.starts_with('{') {
        return Some(title.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::parse_title;

    #[test]
    fn parses_json_object_title() {
        assert_eq!(parse_title(r#"{"title": "Cats and dogs"}"#), Some("Cats and dogs".into()));
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "```json\n{\"title\": \"Trip plan\"}\n```";
        assert_eq!(parse_title(raw), Some("Trip plan".into()));
    }

    #[test]
    fn falls_back_to_raw_text() {
        assert_eq!(parse_title("\"Rust questions\""), Some("Rust questions".into()));
    }

    #[test]
    fn rejects_unparsed_json_blobs() {
        assert_eq!(parse_title("{\"totally\": \"unrelated\""), None);
    }
}
