mod manager;
pub mod sync;
mod types;

pub use manager::{CacheDefaults, CacheManager};
pub use types::{ApiPreset, ChatMessage, DirtySets, Memory, Persona, Session, TokenUsage, UserSettings};
