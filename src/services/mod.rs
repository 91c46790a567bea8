//! Thin semantic operations over the cache.
//!
//! Conversation writes come in two modes: "current" resolves the persona and
//! session at call time, "explicit" takes a session id. The chat pipeline
//! always uses the explicit mode so a turn keeps writing to the persona and
//! session it pinned at its start.

mod conversations;
mod export;
mod memories;
mod personas;
mod sessions;
mod tokens;
mod users;

use std::sync::Arc;

use crate::cache::CacheManager;
use crate::config::Config;
use crate::embeddings::EmbeddingClient;

pub struct Services {
    cache: Arc<CacheManager>,
    embeddings: Option<Arc<EmbeddingClient>>,
    memory_top_k: usize,
    similarity_threshold: f32,
    dedup_threshold: f32,
    default_system_prompt: String,
}

impl Services {
    pub fn new(cache: Arc<CacheManager>, embeddings: Option<Arc<EmbeddingClient>>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            cache,
            embeddings,
            memory_top_k: config.memory_top_k,
            similarity_threshold: config.memory_similarity_threshold,
            dedup_threshold: config.memory_dedup_threshold,
            default_system_prompt: config.default_system_prompt.clone(),
        })
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }
}
