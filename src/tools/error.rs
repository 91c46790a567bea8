use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Search failed: {0}")]
    SearchFailed(String),
    #[error("Fetch failed: {0}")]
    FetchFailed(String),
    #[error("URL not permitted: {0}")]
    UrlRejected(String),
    #[error("Wikipedia search failed: {0}")]
    WikipediaFailed(String),
    #[error("TTS failed: {0}")]
    TtsFailed(String),
}
