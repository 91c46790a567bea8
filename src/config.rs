use anyhow::{Context, Result};
use std::time::Duration;

/// Telegram message length limit.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Minimum interval between streaming message edits.
pub const STREAM_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between database sync cycles.
pub const DB_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Tool-call rounds per turn (plus one final reply).
pub const MAX_TOOL_ROUNDS: usize = 3;

/// Deadline for a single batch of tool executions.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum accepted upload size (20MB).
pub const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// Maximum characters of a text file forwarded into a turn.
pub const MAX_TEXT_CONTENT_LENGTH: usize = 100_000;

pub const DEFAULT_ENABLED_TOOLS: &str = "memory,search,fetch,wikipedia,tts";

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: String,
    pub telegram_api_base: Option<String>,
    pub database_url: String,
    pub health_port: u16,

    pub default_api_key: String,
    pub default_base_url: String,
    pub default_model: String,
    pub default_temperature: f64,
    pub default_system_prompt: String,

    pub embedding_api_key: Option<String>,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub memory_top_k: usize,
    pub memory_similarity_threshold: f32,
    pub memory_dedup_threshold: f32,

    pub browserless_token: Option<String>,
    pub ollama_api_key: Option<String>,
    pub jina_api_key: Option<String>,

    pub tts_api_key: Option<String>,
    pub tts_endpoint: String,
    pub tts_voice: String,
    pub tts_style: String,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            telegram_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .context("TELEGRAM_BOT_TOKEN not set")?,
            telegram_api_base: env_opt("TELEGRAM_API_BASE")
                .map(|s| s.trim_end_matches('/').to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:gemen.db?mode=rwc".to_string()),
            health_port: std::env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),

            default_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            default_base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            default_model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            default_temperature: std::env::var("OPENAI_TEMPERATURE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.7),
            default_system_prompt: std::env::var("OPENAI_SYSTEM_PROMPT")
                .unwrap_or_else(|_| "You are a helpful assistant.".to_string()),

            embedding_api_key: env_opt("EMBEDDING_API_KEY"),
            embedding_base_url: std::env::var("EMBEDDING_BASE_URL")
                .unwrap_or_else(|_| "https://integrate.api.nvidia.com/v1".to_string()),
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "baai/bge-m3".to_string()),
            memory_top_k: std::env::var("MEMORY_TOP_K")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            memory_similarity_threshold: std::env::var("MEMORY_SIMILARITY_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.35),
            memory_dedup_threshold: std::env::var("MEMORY_DEDUP_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.85),

            browserless_token: env_opt("BROWSERLESS_API_TOKEN"),
            ollama_api_key: env_opt("OLLAMA_API_KEY"),
            jina_api_key: env_opt("JINA_API_KEY"),

            tts_api_key: env_opt("TTS_API_KEY"),
            tts_endpoint: std::env::var("TTS_ENDPOINT").unwrap_or_default(),
            tts_voice: std::env::var("TTS_VOICE")
                .unwrap_or_else(|_| "zh-CN-XiaoxiaoMultilingualNeural".to_string()),
            tts_style: std::env::var("TTS_STYLE").unwrap_or_else(|_| "general".to_string()),
        })
    }
}
