//! Process-wide in-memory cache with dirty-set tracking.
//!
//! The cache is the authoritative image of all user state; the database lags
//! behind it by at most one sync interval. Every mutation goes through a
//! method here so the matching dirty entry is recorded under the lock.
//!
//! New sessions and memories receive negative ids from in-process counters so
//! they can be referenced immediately; the sync cycle swaps them for database
//! ids via [`CacheManager::apply_sync_remap`].

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::config::{Config, DEFAULT_ENABLED_TOOLS};

use super::types::{ChatMessage, DirtySets, Memory, Persona, Session, TokenUsage, UserSettings};

/// Per-user defaults applied on first interaction, taken from the environment.
#[derive(Debug, Clone)]
pub struct CacheDefaults {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub system_prompt: String,
    pub enabled_tools: String,
    pub tts_voice: String,
    pub tts_style: String,
}

impl CacheDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_key: config.default_api_key.clone(),
            base_url: config.default_base_url.clone(),
            model: config.default_model.clone(),
            temperature: config.default_temperature,
            system_prompt: config.default_system_prompt.clone(),
            enabled_tools: DEFAULT_ENABLED_TOOLS.to_string(),
            tts_voice: config.tts_voice.clone(),
            tts_style: config.tts_style.clone(),
        }
    }

    fn settings(&self) -> UserSettings {
        UserSettings {
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            token_limit: 0,
            current_persona: "default".to_string(),
            enabled_tools: self.enabled_tools.clone(),
            tts_voice: self.tts_voice.clone(),
            tts_style: self.tts_style.clone(),
            tts_endpoint: String::new(),
            api_presets: HashMap::new(),
            title_model: String::new(),
        }
    }
}

#[derive(Default)]
struct CacheState {
    settings: HashMap<i64, UserSettings>,
    personas: HashMap<i64, HashMap<String, Persona>>,
    sessions: HashMap<(i64, String), Vec<Session>>,
    conversations: HashMap<i64, Vec<ChatMessage>>,
    persona_tokens: HashMap<(i64, String), TokenUsage>,
    memories: HashMap<i64, Vec<Memory>>,
    dirty: DirtySets,
    /// Highest database session id seen, for logging/diagnostics.
    session_id_counter: i64,
    temp_session_counter: i64,
    temp_memory_counter: i64,
    /// temp id -> db id, so writers holding a pinned temporary id keep
    /// landing on the right session after a sync remapped it.
    remapped_sessions: HashMap<i64, i64>,
}

impl CacheState {
    fn resolve_session_id(&self, session_id: i64) -> i64 {
        *self.remapped_sessions.get(&session_id).unwrap_or(&session_id)
    }
}

pub struct CacheManager {
    defaults: CacheDefaults,
    inner: Mutex<CacheState>,
}

impl CacheManager {
    pub fn new(defaults: CacheDefaults) -> Self {
        Self { defaults, inner: Mutex::new(CacheState::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.inner.lock().expect("cache lock poisoned")
    }

    pub fn defaults(&self) -> &CacheDefaults {
        &self.defaults
    }

    // -- settings --

    fn ensure_user(state: &mut CacheState, defaults: &CacheDefaults, user_id: i64) {
        if !state.settings.contains_key(&user_id) {
            state.settings.insert(user_id, defaults.settings());
            state.dirty.settings.insert(user_id);
        }
        let personas = state.personas.entry(user_id).or_default();
        if !personas.contains_key("default") {
            personas.insert(
                "default".to_string(),
                Persona {
                    name: "default".to_string(),
                    system_prompt: defaults.system_prompt.clone(),
                    current_session_id: None,
                },
            );
            state.dirty.personas.insert((user_id, "default".to_string()));
        }
    }

    pub fn get_settings(&self, user_id: i64) -> UserSettings {
        let mut state = self.lock();
        Self::ensure_user(&mut state, &self.defaults, user_id);
        state.settings[&user_id].clone()
    }

    pub fn update_settings<F: FnOnce(&mut UserSettings)>(&self, user_id: i64, f: F) {
        let mut state = self.lock();
        Self::ensure_user(&mut state, &self.defaults, user_id);
        f(state.settings.get_mut(&user_id).expect("settings ensured"));
        state.dirty.settings.insert(user_id);
    }

    /// Used during startup load only: no dirty marking.
    pub fn set_settings(&self, user_id: i64, settings: UserSettings) {
        self.lock().settings.insert(user_id, settings);
    }

    pub fn get_current_persona_name(&self, user_id: i64) -> String {
        self.get_settings(user_id).current_persona
    }

    pub fn set_current_persona(&self, user_id: i64, name: &str) {
        self.update_settings(user_id, |s| s.current_persona = name.to_string());
    }

    pub fn get_token_limit(&self, user_id: i64) -> i64 {
        self.get_settings(user_id).token_limit
    }

    // -- personas --

    /// All personas for a user, "default" first, the rest by name.
    pub fn get_personas(&self, user_id: i64) -> Vec<Persona> {
        let mut state = self.lock();
        Self::ensure_user(&mut state, &self.defaults, user_id);
        let mut personas: Vec<Persona> = state.personas[&user_id].values().cloned().collect();
        personas.sort_by(|a, b| {
            (a.name != "default").cmp(&(b.name != "default")).then(a.name.cmp(&b.name))
        });
        personas
    }

    pub fn get_persona(&self, user_id: i64, name: &str) -> Option<Persona> {
        let mut state = self.lock();
        Self::ensure_user(&mut state, &self.defaults, user_id);
        state.personas.get(&user_id).and_then(|m| m.get(name)).cloned()
    }

    pub fn get_current_persona(&self, user_id: i64) -> Persona {
        let name = self.get_current_persona_name(user_id);
        match self.get_persona(user_id, &name) {
            Some(p) => p,
            // Current pointer referenced a removed persona: fall back.
            None => self.get_persona(user_id, "default").expect("default persona ensured"),
        }
    }

    pub fn create_persona(&self, user_id: i64, name: &str, system_prompt: &str) -> bool {
        let mut state = self.lock();
        Self::ensure_user(&mut state, &self.defaults, user_id);
        let personas = state.personas.entry(user_id).or_default();
        if personas.contains_key(name) {
            return false;
        }
        personas.insert(
            name.to_string(),
            Persona {
                name: name.to_string(),
                system_prompt: system_prompt.to_string(),
                current_session_id: None,
            },
        );
        state.dirty.personas.insert((user_id, name.to_string()));
        true
    }

    pub fn update_persona_prompt(&self, user_id: i64, name: &str, prompt: &str) -> bool {
        let mut state = self.lock();
        let Some(persona) = state.personas.get_mut(&user_id).and_then(|m| m.get_mut(name)) else {
            return false;
        };
        persona.system_prompt = prompt.to_string();
        state.dirty.personas.insert((user_id, name.to_string()));
        true
    }

    /// Delete a persona and cascade over its sessions, conversations and
    /// token row. "default" is refused.
    pub fn delete_persona(&self, user_id: i64, name: &str) -> bool {
        if name == "default" {
            return false;
        }
        let mut state = self.lock();
        let existed = state
            .personas
            .get_mut(&user_id)
            .map(|m| m.remove(name).is_some())
            .unwrap_or(false);
        if !existed {
            return false;
        }
        let key = (user_id, name.to_string());
        if let Some(list) = state.sessions.remove(&key) {
            for session in &list {
                state.conversations.remove(&session.id);
                state.dirty.conversations.remove(&session.id);
                state.dirty.cleared_conversations.remove(&session.id);
                state.dirty.dirty_session_titles.remove(&session.id);
                state.dirty.deleted_sessions.remove(&session.id);
            }
        }
        state
            .dirty
            .new_sessions
            .retain(|s| !(s.user_id == user_id && s.persona_name == name));
        state.persona_tokens.remove(&key);
        state.dirty.tokens.remove(&key);
        state.dirty.personas.remove(&key);
        state.dirty.deleted_personas.insert(key);
        let was_current = state
            .settings
            .get(&user_id)
            .map(|s| s.current_persona == name)
            .unwrap_or(false);
        if was_current {
            if let Some(settings) = state.settings.get_mut(&user_id) {
                settings.current_persona = "default".to_string();
            }
            state.dirty.settings.insert(user_id);
        }
        true
    }

    /// Used during startup load only.
    pub fn set_persona(&self, user_id: i64, persona: Persona) {
        self.lock()
            .personas
            .entry(user_id)
            .or_default()
            .insert(persona.name.clone(), persona);
    }

    // -- sessions --

    pub fn get_sessions(&self, user_id: i64, persona_name: &str) -> Vec<Session> {
        self.lock()
            .sessions
            .get(&(user_id, persona_name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Used during startup load only.
    pub fn set_sessions(&self, user_id: i64, persona_name: &str, sessions: Vec<Session>) {
        self.lock().sessions.insert((user_id, persona_name.to_string()), sessions);
    }

    pub fn get_session_by_id(&self, session_id: i64) -> Option<Session> {
        let state = self.lock();
        let id = state.resolve_session_id(session_id);
        state
            .sessions
            .values()
            .flat_map(|list| list.iter())
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn create_session(&self, user_id: i64, persona_name: &str, title: Option<String>) -> Session {
        let mut state = self.lock();
        state.temp_session_counter -= 1;
        let session = Session {
            id: state.temp_session_counter,
            user_id,
            persona_name: persona_name.to_string(),
            title,
            created_at: Some(Utc::now().to_rfc3339()),
        };
        state
            .sessions
            .entry((user_id, persona_name.to_string()))
            .or_default()
            .push(session.clone());
        state.conversations.insert(session.id, Vec::new());
        state.dirty.new_sessions.push(session.clone());
        session
    }

    pub fn get_current_session_id(&self, user_id: i64, persona_name: &str) -> Option<i64> {
        let state = self.lock();
        let id = state
            .personas
            .get(&user_id)
            .and_then(|m| m.get(persona_name))
            .and_then(|p| p.current_session_id)?;
        Some(state.resolve_session_id(id))
    }

    pub fn set_current_session_id(&self, user_id: i64, persona_name: &str, session_id: i64) {
        let mut state = self.lock();
        let session_id = state.resolve_session_id(session_id);
        if let Some(persona) = state.personas.get_mut(&user_id).and_then(|m| m.get_mut(persona_name)) {
            persona.current_session_id = Some(session_id);
            state.dirty.personas.insert((user_id, persona_name.to_string()));
        }
    }

    /// Current session for the persona, created on demand.
    pub fn ensure_session_id(&self, user_id: i64, persona_name: &str) -> i64 {
        {
            let mut state = self.lock();
            Self::ensure_user(&mut state, &self.defaults, user_id);
            let key = (user_id, persona_name.to_string());
            let current = state
                .personas
                .get(&user_id)
                .and_then(|m| m.get(persona_name))
                .and_then(|p| p.current_session_id)
                .map(|id| state.resolve_session_id(id));
            if let Some(id) = current {
                let exists = state.sessions.get(&key).map(|l| l.iter().any(|s| s.id == id));
                if exists == Some(true) {
                    return id;
                }
            }
            if let Some(last) = state.sessions.get(&key).and_then(|l| l.last()) {
                let id = last.id;
                if let Some(persona) = state.personas.get_mut(&user_id).and_then(|m| m.get_mut(persona_name)) {
                    persona.current_session_id = Some(id);
                }
                state.dirty.personas.insert((user_id, persona_name.to_string()));
                return id;
            }
        }
        let session = self.create_session(user_id, persona_name, None);
        self.set_current_session_id(user_id, persona_name, session.id);
        session.id
    }

    pub fn update_session_title(&self, session_id: i64, title: &str) -> bool {
        let mut state = self.lock();
        let id = state.resolve_session_id(session_id);
        let mut found = false;
        for list in state.sessions.values_mut() {
            if let Some(session) = list.iter_mut().find(|s| s.id == id) {
                session.title = Some(title.to_string());
                found = true;
                break;
            }
        }
        if found {
            state.dirty.dirty_session_titles.insert(id, title.to_string());
        }
        found
    }

    pub fn delete_session(&self, user_id: i64, persona_name: &str, session_id: i64) -> bool {
        let mut state = self.lock();
        let id = state.resolve_session_id(session_id);
        let key = (user_id, persona_name.to_string());
        let Some(list) = state.sessions.get_mut(&key) else { return false };
        let Some(pos) = list.iter().position(|s| s.id == id) else { return false };
        list.remove(pos);
        state.conversations.remove(&id);
        state.dirty.conversations.remove(&id);
        state.dirty.cleared_conversations.remove(&id);
        state.dirty.dirty_session_titles.remove(&id);
        // Temporary ids stay in new_sessions: the sync cycle inserts the row,
        // remaps this entry, and deletes it in the same transaction.
        state.dirty.deleted_sessions.insert(id);
        if let Some(persona) = state.personas.get_mut(&user_id).and_then(|m| m.get_mut(persona_name)) {
            if persona.current_session_id == Some(id) {
                persona.current_session_id = None;
                state.dirty.personas.insert((user_id, persona_name.to_string()));
            }
        }
        true
    }

    // -- conversations --

    pub fn get_conversation_by_session(&self, session_id: i64) -> Vec<ChatMessage> {
        let state = self.lock();
        let id = state.resolve_session_id(session_id);
        state.conversations.get(&id).cloned().unwrap_or_default()
    }

    pub fn add_message_to_session(&self, session_id: i64, role: &str, content: &str) {
        let mut state = self.lock();
        let id = state.resolve_session_id(session_id);
        state.conversations.entry(id).or_default().push(ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
        });
        state.dirty.conversations.insert(id);
    }

    pub fn clear_conversation_by_session(&self, session_id: i64) {
        let mut state = self.lock();
        let id = state.resolve_session_id(session_id);
        state.conversations.insert(id, Vec::new());
        state.dirty.cleared_conversations.insert(id);
        state.dirty.conversations.remove(&id);
    }

    /// Used during startup load only.
    pub fn set_conversation_by_session(&self, session_id: i64, messages: Vec<ChatMessage>) {
        self.lock().conversations.insert(session_id, messages);
    }

    /// Drop the trailing assistant message(s) and the user message before
    /// them. The session's rows are rewritten at the next sync so the
    /// persisted list matches the cache again.
    pub fn pop_last_exchange(&self, session_id: i64) -> bool {
        let mut state = self.lock();
        let id = state.resolve_session_id(session_id);
        let Some(list) = state.conversations.get_mut(&id) else { return false };
        if list.is_empty() {
            return false;
        }
        while list.last().map(|m| m.role == "assistant").unwrap_or(false) {
            list.pop();
        }
        if list.last().map(|m| m.role == "user").unwrap_or(false) {
            list.pop();
        }
        state.dirty.cleared_conversations.insert(id);
        state.dirty.conversations.insert(id);
        true
    }

    pub fn session_message_count(&self, session_id: i64) -> usize {
        let state = self.lock();
        let id = state.resolve_session_id(session_id);
        state.conversations.get(&id).map(|l| l.len()).unwrap_or(0)
    }

    // -- token usage --

    pub fn get_token_usage(&self, user_id: i64, persona_name: &str) -> TokenUsage {
        self.lock()
            .persona_tokens
            .get(&(user_id, persona_name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_token_usage(&self, user_id: i64, persona_name: &str, prompt: i64, completion: i64) {
        let mut state = self.lock();
        let key = (user_id, persona_name.to_string());
        let usage = state.persona_tokens.entry(key.clone()).or_default();
        usage.prompt_tokens += prompt;
        usage.completion_tokens += completion;
        usage.total_tokens += prompt + completion;
        state.dirty.tokens.insert(key);
    }

    pub fn reset_token_usage(&self, user_id: i64, persona_name: &str) {
        let mut state = self.lock();
        let key = (user_id, persona_name.to_string());
        state.persona_tokens.insert(key.clone(), TokenUsage::default());
        state.dirty.tokens.insert(key);
    }

    /// Used during startup load only.
    pub fn set_token_usage(&self, user_id: i64, persona_name: &str, usage: TokenUsage) {
        self.lock().persona_tokens.insert((user_id, persona_name.to_string()), usage);
    }

    pub fn total_tokens_all_personas(&self, user_id: i64) -> i64 {
        self.lock()
            .persona_tokens
            .iter()
            .filter(|((uid, _), _)| *uid == user_id)
            .map(|(_, usage)| usage.total_tokens)
            .sum()
    }

    // -- memories --

    pub fn get_memories(&self, user_id: i64) -> Vec<Memory> {
        self.lock().memories.get(&user_id).cloned().unwrap_or_default()
    }

    pub fn add_memory(
        &self,
        user_id: i64,
        content: &str,
        source: &str,
        embedding: Option<Vec<f32>>,
    ) -> Memory {
        let mut state = self.lock();
        state.temp_memory_counter -= 1;
        let memory = Memory {
            id: state.temp_memory_counter,
            user_id,
            content: content.to_string(),
            source: source.to_string(),
            embedding,
        };
        state.memories.entry(user_id).or_default().push(memory.clone());
        state.dirty.new_memories.push(memory.clone());
        memory
    }

    /// Delete by 0-based index. A memory that never reached the database is
    /// withdrawn from the pending inserts instead of recorded as deleted.
    pub fn delete_memory(&self, user_id: i64, index: usize) -> bool {
        let mut state = self.lock();
        let Some(list) = state.memories.get_mut(&user_id) else { return false };
        if index >= list.len() {
            return false;
        }
        let removed = list.remove(index);
        if removed.id < 0 {
            state.dirty.new_memories.retain(|m| m.id != removed.id);
        } else {
            state.dirty.deleted_memory_ids.push(removed.id);
        }
        true
    }

    pub fn clear_memories(&self, user_id: i64) -> usize {
        let mut state = self.lock();
        let count = state.memories.get(&user_id).map(|l| l.len()).unwrap_or(0);
        state.memories.insert(user_id, Vec::new());
        state.dirty.cleared_memories.insert(user_id);
        state.dirty.new_memories.retain(|m| m.user_id != user_id);
        count
    }

    /// Used during startup load only.
    pub fn set_memories(&self, user_id: i64, memories: Vec<Memory>) {
        self.lock().memories.insert(user_id, memories);
    }

    // -- sync support --

    pub fn get_and_clear_dirty(&self) -> DirtySets {
        std::mem::take(&mut self.lock().dirty)
    }

    /// Re-union a failed cycle's dirty sets with whatever accumulated since.
    pub fn restore_dirty(&self, dirty: DirtySets) {
        let mut state = self.lock();
        state.dirty.settings.extend(dirty.settings);
        state.dirty.personas.extend(dirty.personas);
        state.dirty.deleted_personas.extend(dirty.deleted_personas);
        state.dirty.conversations.extend(dirty.conversations);
        state.dirty.cleared_conversations.extend(dirty.cleared_conversations);
        state.dirty.tokens.extend(dirty.tokens);
        state.dirty.new_sessions.extend(dirty.new_sessions);
        for (id, title) in dirty.dirty_session_titles {
            state.dirty.dirty_session_titles.entry(id).or_insert(title);
        }
        state.dirty.deleted_sessions.extend(dirty.deleted_sessions);
        state.dirty.new_memories.extend(dirty.new_memories);
        state.dirty.deleted_memory_ids.extend(dirty.deleted_memory_ids);
        state.dirty.cleared_memories.extend(dirty.cleared_memories);
    }

    pub fn settings_snapshot(&self, user_id: i64) -> Option<UserSettings> {
        self.lock().settings.get(&user_id).cloned()
    }

    pub fn persona_snapshot(&self, user_id: i64, name: &str) -> Option<Persona> {
        self.lock().personas.get(&user_id).and_then(|m| m.get(name)).cloned()
    }

    pub fn token_snapshot(&self, user_id: i64, persona_name: &str) -> Option<TokenUsage> {
        self.lock().persona_tokens.get(&(user_id, persona_name.to_string())).cloned()
    }

    /// Swap temporary ids for database ids everywhere they may be referenced:
    /// the session objects, the conversations map, the persona's current
    /// pointer, and any dirty entries recorded while the sync cycle ran.
    pub fn apply_sync_remap(&self, session_map: &HashMap<i64, i64>, memory_map: &[(i64, i64, i64)]) {
        let mut state = self.lock();
        for (&old, &new) in session_map {
            if let Some(messages) = state.conversations.remove(&old) {
                state.conversations.insert(new, messages);
            }
            if state.dirty.conversations.remove(&old) {
                state.dirty.conversations.insert(new);
            }
            if state.dirty.cleared_conversations.remove(&old) {
                state.dirty.cleared_conversations.insert(new);
            }
            if state.dirty.deleted_sessions.remove(&old) {
                state.dirty.deleted_sessions.insert(new);
            }
            if let Some(title) = state.dirty.dirty_session_titles.remove(&old) {
                state.dirty.dirty_session_titles.insert(new, title);
            }
            for list in state.sessions.values_mut() {
                for session in list.iter_mut() {
                    if session.id == old {
                        session.id = new;
                    }
                }
            }
            for personas in state.personas.values_mut() {
                for persona in personas.values_mut() {
                    if persona.current_session_id == Some(old) {
                        persona.current_session_id = Some(new);
                    }
                }
            }
            state.remapped_sessions.insert(old, new);
            if new > state.session_id_counter {
                state.session_id_counter = new;
            }
        }
        for &(user_id, temp_id, db_id) in memory_map {
            let mut assigned = false;
            if let Some(list) = state.memories.get_mut(&user_id) {
                for memory in list.iter_mut() {
                    if memory.id == temp_id {
                        memory.id = db_id;
                        assigned = true;
                    }
                }
            }
            if !assigned {
                // Deleted from the cache while its insert was in flight;
                // schedule the fresh row for removal.
                state.dirty.deleted_memory_ids.push(db_id);
            }
        }
    }

    pub fn seed_session_counter(&self, max_id: i64) {
        let mut state = self.lock();
        if max_id > state.session_id_counter {
            state.session_id_counter = max_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> CacheManager {
        CacheManager::new(CacheDefaults {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o".into(),
            temperature: 0.7,
            system_prompt: "You are a helpful assistant.".into(),
            enabled_tools: DEFAULT_ENABLED_TOOLS.into(),
            tts_voice: "voice".into(),
            tts_style: "general".into(),
        })
    }

    #[test]
    fn first_interaction_creates_defaults_and_default_persona() {
        let cache = cache();
        let settings = cache.get_settings(7);
        assert_eq!(settings.current_persona, "default");
        assert!(cache.get_persona(7, "default").is_some());
        let dirty = cache.get_and_clear_dirty();
        assert!(dirty.settings.contains(&7));
        assert!(dirty.personas.contains(&(7, "default".to_string())));
    }

    #[test]
    fn new_sessions_get_decreasing_temporary_ids() {
        let cache = cache();
        cache.get_settings(1);
        let a = cache.create_session(1, "default", None);
        let b = cache.create_session(1, "default", None);
        assert!(a.id < 0);
        assert!(b.id < a.id);
    }

    #[test]
    fn ensure_session_creates_and_pins_current() {
        let cache = cache();
        let id = cache.ensure_session_id(1, "default");
        assert!(id < 0);
        assert_eq!(cache.ensure_session_id(1, "default"), id);
        assert_eq!(cache.get_current_session_id(1, "default"), Some(id));
    }

    #[test]
    fn pop_last_exchange_removes_one_pair() {
        let cache = cache();
        let id = cache.ensure_session_id(1, "default");
        cache.add_message_to_session(id, "user", "hi");
        cache.add_message_to_session(id, "assistant", "hello");
        cache.add_message_to_session(id, "user", "again");
        cache.add_message_to_session(id, "assistant", "sure");
        assert!(cache.pop_last_exchange(id));
        let conv = cache.get_conversation_by_session(id);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[1].role, "assistant");
    }

    #[test]
    fn delete_persona_cascades_and_refuses_default() {
        let cache = cache();
        cache.get_settings(1);
        assert!(!cache.delete_persona(1, "default"));
        cache.create_persona(1, "coder", "You write code.");
        cache.set_current_persona(1, "coder");
        let sid = cache.ensure_session_id(1, "coder");
        cache.add_message_to_session(sid, "user", "hi");
        cache.add_token_usage(1, "coder", 10, 5);
        assert!(cache.delete_persona(1, "coder"));
        assert!(cache.get_persona(1, "coder").is_none());
        assert!(cache.get_sessions(1, "coder").is_empty());
        assert_eq!(cache.get_conversation_by_session(sid), Vec::new());
        assert_eq!(cache.get_current_persona_name(1), "default");
        let dirty = cache.get_and_clear_dirty();
        assert!(dirty.deleted_personas.contains(&(1, "coder".to_string())));
        assert!(dirty.new_sessions.iter().all(|s| s.persona_name != "coder"));
    }

    #[test]
    fn remap_moves_conversations_and_forwards_stale_writers() {
        let cache = cache();
        let temp = cache.ensure_session_id(1, "default");
        cache.add_message_to_session(temp, "user", "hi");
        let _ = cache.get_and_clear_dirty();
        let mut map = HashMap::new();
        map.insert(temp, 42);
        cache.apply_sync_remap(&map, &[]);
        assert_eq!(cache.get_current_session_id(1, "default"), Some(42));
        // A writer that pinned the temporary id still reaches the session.
        cache.add_message_to_session(temp, "assistant", "hello");
        assert_eq!(cache.get_conversation_by_session(42).len(), 2);
        let dirty = cache.get_and_clear_dirty();
        assert!(dirty.conversations.contains(&42));
        assert!(!dirty.conversations.contains(&temp));
    }

    #[test]
    fn deleting_unsynced_memory_withdraws_pending_insert() {
        let cache = cache();
        cache.add_memory(1, "likes rust", "user", None);
        assert!(cache.delete_memory(1, 0));
        let dirty = cache.get_and_clear_dirty();
        assert!(dirty.new_memories.is_empty());
        assert!(dirty.deleted_memory_ids.is_empty());
    }

    #[test]
    fn token_totals_sum_across_personas() {
        let cache = cache();
        cache.get_settings(1);
        cache.create_persona(1, "coder", "p");
        cache.add_token_usage(1, "default", 100, 50);
        cache.add_token_usage(1, "coder", 10, 5);
        let usage = cache.get_token_usage(1, "default");
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
        assert_eq!(cache.total_tokens_all_personas(1), 165);
    }
}
