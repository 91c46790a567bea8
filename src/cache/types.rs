use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One saved provider preset (`/set provider save <name>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPreset {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct UserSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub token_limit: i64,
    pub current_persona: String,
    pub enabled_tools: String,
    pub tts_voice: String,
    pub tts_style: String,
    pub tts_endpoint: String,
    pub api_presets: HashMap<String, ApiPreset>,
    pub title_model: String,
}

#[derive(Debug, Clone)]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
    /// Weak reference into the session list; never owned through here.
    pub current_session_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Session {
    /// Negative until the first sync assigns the database id.
    pub id: i64,
    pub user_id: i64,
    pub persona_name: String,
    pub title: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct Memory {
    /// Negative until the first sync assigns the database id.
    pub id: i64,
    pub user_id: i64,
    pub content: String,
    pub source: String,
    pub embedding: Option<Vec<f32>>,
}

/// Everything modified since the last successful sync, grouped by change kind.
///
/// `new_sessions` and `new_memories` hold value snapshots taken at mutation
/// time; the sync cycle inserts from the snapshot and remaps the temporary id
/// back into the live cache afterwards.
#[derive(Debug, Default, Clone)]
pub struct DirtySets {
    pub settings: HashSet<i64>,
    pub personas: HashSet<(i64, String)>,
    pub deleted_personas: HashSet<(i64, String)>,
    pub conversations: HashSet<i64>,
    pub cleared_conversations: HashSet<i64>,
    pub tokens: HashSet<(i64, String)>,
    pub new_sessions: Vec<Session>,
    pub dirty_session_titles: HashMap<i64, String>,
    pub deleted_sessions: HashSet<i64>,
    pub new_memories: Vec<Memory>,
    pub deleted_memory_ids: Vec<i64>,
    pub cleared_memories: HashSet<i64>,
}

impl DirtySets {
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
            && self.personas.is_empty()
            && self.deleted_personas.is_empty()
            && self.conversations.is_empty()
            && self.cleared_conversations.is_empty()
            && self.tokens.is_empty()
            && self.new_sessions.is_empty()
            && self.dirty_session_titles.is_empty()
            && self.deleted_sessions.is_empty()
            && self.new_memories.is_empty()
            && self.deleted_memory_ids.is_empty()
            && self.cleared_memories.is_empty()
    }
}
