//! User settings operations.

use crate::cache::{ApiPreset, UserSettings};
use crate::error::BotError;

use super::Services;

/// Tool names that can be toggled via `/set tool <name> <on|off>`.
pub const KNOWN_TOOLS: &[&str] = &["memory", "search", "fetch", "wikipedia", "tts"];

impl Services {
    pub fn get_user_settings(&self, user_id: i64) -> UserSettings {
        self.cache.get_settings(user_id)
    }

    pub fn has_api_key(&self, user_id: i64) -> bool {
        !self.cache.get_settings(user_id).api_key.is_empty()
    }

    pub fn set_base_url(&self, user_id: i64, value: &str) {
        let value = value.trim_end_matches('/').to_string();
        self.cache.update_settings(user_id, |s| s.base_url = value);
    }

    pub fn set_api_key(&self, user_id: i64, value: &str) {
        let value = value.to_string();
        self.cache.update_settings(user_id, |s| s.api_key = value);
    }

    pub fn set_model(&self, user_id: i64, value: &str) {
        let value = value.to_string();
        self.cache.update_settings(user_id, |s| s.model = value);
    }

    pub fn set_title_model(&self, user_id: i64, value: &str) {
        let value = value.to_string();
        self.cache.update_settings(user_id, |s| s.title_model = value);
    }

    pub fn set_temperature(&self, user_id: i64, value: f64) -> Result<(), BotError> {
        if !(0.0..=2.0).contains(&value) {
            return Err(BotError::Precondition(
                "Temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        self.cache.update_settings(user_id, |s| s.temperature = value);
        Ok(())
    }

    pub fn set_token_limit(&self, user_id: i64, value: i64) -> Result<(), BotError> {
        if value < 0 {
            return Err(BotError::Precondition("Token limit must be non-negative".to_string()));
        }
        self.cache.update_settings(user_id, |s| s.token_limit = value);
        Ok(())
    }

    pub fn set_tts_voice(&self, user_id: i64, value: &str) {
        let value = value.to_string();
        self.cache.update_settings(user_id, |s| s.tts_voice = value);
    }

    pub fn set_tts_style(&self, user_id: i64, value: &str) {
        let value = value.to_string();
        self.cache.update_settings(user_id, |s| s.tts_style = value);
    }

    pub fn set_tts_endpoint(&self, user_id: i64, value: &str) {
        let value = value.to_string();
        self.cache.update_settings(user_id, |s| s.tts_endpoint = value);
    }

    pub fn set_tool_enabled(&self, user_id: i64, tool: &str, enabled: bool) -> Result<String, BotError> {
        let tool = tool.to_lowercase();
        if !KNOWN_TOOLS.contains(&tool.as_str()) {
            return Err(BotError::Precondition(format!(
                "Unknown tool: {tool}. Available: {}",
                KNOWN_TOOLS.join(", ")
            )));
        }
        let mut result = String::new();
        self.cache.update_settings(user_id, |s| {
            let mut tools: Vec<String> = s
                .enabled_tools
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if enabled {
                if !tools.iter().any(|t| t == &tool) {
                    tools.push(tool.clone());
                }
            } else {
                tools.retain(|t| t != &tool);
            }
            s.enabled_tools = tools.join(",");
            result = s.enabled_tools.clone();
        });
        Ok(result)
    }

    // -- provider presets --

    pub fn list_providers(&self, user_id: i64) -> Vec<(String, ApiPreset)> {
        let settings = self.cache.get_settings(user_id);
        let mut entries: Vec<(String, ApiPreset)> = settings.api_presets.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Save the current api_key/base_url/model under a provider name.
    pub fn save_provider(&self, user_id: i64, name: &str) -> Result<(), BotError> {
        if name.is_empty() {
            return Err(BotError::Precondition("Provider name cannot be empty".to_string()));
        }
        let name = name.to_string();
        self.cache.update_settings(user_id, |s| {
            s.api_presets.insert(
                name,
                ApiPreset {
                    api_key: s.api_key.clone(),
                    base_url: s.base_url.clone(),
                    model: s.model.clone(),
                },
            );
        });
        Ok(())
    }

    /// Load a saved preset into the active api_key/base_url/model.
    pub fn load_provider(&self, user_id: i64, name: &str) -> Result<ApiPreset, BotError> {
        let settings = self.cache.get_settings(user_id);
        let preset = lookup_preset(&settings, name).ok_or_else(|| {
            BotError::Precondition(format!("Provider '{name}' not found. Use /set provider list"))
        })?;
        let loaded = preset.clone();
        self.cache.update_settings(user_id, |s| {
            s.api_key = loaded.api_key.clone();
            s.base_url = loaded.base_url.clone();
            s.model = loaded.model.clone();
        });
        Ok(preset)
    }

    pub fn delete_provider(&self, user_id: i64, name: &str) -> Result<(), BotError> {
        let mut removed = false;
        let name_owned = name.to_string();
        self.cache.update_settings(user_id, |s| {
            let key = s
                .api_presets
                .keys()
                .find(|k| k.eq_ignore_ascii_case(&name_owned))
                .cloned();
            if let Some(key) = key {
                s.api_presets.remove(&key);
                removed = true;
            }
        });
        if removed {
            Ok(())
        } else {
            Err(BotError::Precondition(format!("Provider '{name}' not found.")))
        }
    }

    pub fn find_provider(&self, user_id: i64, name: &str) -> Option<ApiPreset> {
        lookup_preset(&self.cache.get_settings(user_id), name)
    }
}

fn lookup_preset(settings: &UserSettings, name: &str) -> Option<ApiPreset> {
    settings
        .api_presets
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}
