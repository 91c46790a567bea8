use thiserror::Error;

/// Failure kinds a chat turn or command can surface.
///
/// Only `Precondition` messages reach the user verbatim; everything else maps
/// to an onboarding hint, the quota notice, or the generic retry text.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("API key not configured")]
    ConfigMissing,
    #[error("Token limit reached")]
    QuotaExceeded,
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("URL not permitted: {0}")]
    UrlRejected(String),
    #[error("{0}")]
    Precondition(String),
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BotError {
    /// Text shown in chat for this failure. Internals are never exposed.
    pub fn user_text(&self) -> String {
        match self {
            BotError::ConfigMissing => {
                "Please set your OpenAI API key first:\n/set api_key YOUR_API_KEY".to_string()
            }
            BotError::QuotaExceeded => {
                "You've reached your token limit. Use /usage to check usage or \
                 /set token_limit <number> to increase it."
                    .to_string()
            }
            BotError::Precondition(msg) => msg.clone(),
            _ => "Error. Please retry.".to_string(),
        }
    }
}
