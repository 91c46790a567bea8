use std::sync::Arc;

use gemen::cache::{CacheDefaults, CacheManager};
use gemen::config::Config;
use gemen::db::Db;
use gemen::services::Services;

pub fn test_config() -> Config {
    Config {
        telegram_token: "test-token".into(),
        telegram_api_base: None,
        database_url: "sqlite::memory:".into(),
        health_port: 0,
        default_api_key: String::new(),
        default_base_url: "https://api.openai.com/v1".into(),
        default_model: "gpt-4o".into(),
        default_temperature: 0.7,
        default_system_prompt: "You are a helpful assistant.".into(),
        embedding_api_key: None,
        embedding_base_url: "https://integrate.api.nvidia.com/v1".into(),
        embedding_model: "baai/bge-m3".into(),
        memory_top_k: 10,
        memory_similarity_threshold: 0.35,
        memory_dedup_threshold: 0.85,
        browserless_token: None,
        ollama_api_key: None,
        jina_api_key: None,
        tts_api_key: None,
        tts_endpoint: String::new(),
        tts_voice: "zh-CN-XiaoxiaoMultilingualNeural".into(),
        tts_style: "general".into(),
    }
}

pub async fn test_env() -> (Arc<Db>, Arc<CacheManager>, Arc<Services>) {
    let config = test_config();
    let db = Arc::new(Db::connect_in_memory().await.unwrap());
    db.migrate().await.unwrap();
    let cache = Arc::new(CacheManager::new(CacheDefaults::from_config(&config)));
    let services = Services::new(cache.clone(), None, &config);
    (db, cache, services)
}
