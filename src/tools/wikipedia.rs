//! Wikipedia search via the MediaWiki API: search, then intro extracts.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use super::{Tool, ToolError};

const MAX_SUMMARY_LEN: usize = 500;
const RESULT_LIMIT: usize = 3;

pub struct WikipediaTool {
    client: reqwest::Client,
}

impl WikipediaTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("GemenBot/1.0")
                .build()
                .unwrap_or_default(),
        }
    }

    async fn api_get(&self, language: &str, params: &[(&str, String)]) -> Result<Value, ToolError> {
        let resp = self
            .client
            .get(format!("https://{language}.wikipedia.org/w/api.php"))
            .query(params)
            .send()
            .await
            .map_err(|e| ToolError::WikipediaFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ToolError::WikipediaFailed(format!("HTTP {}", resp.status())));
        }
        resp.json().await.map_err(|e| ToolError::WikipediaFailed(e.to_string()))
    }

    async fn search_and_summarize(&self, query: &str, language: &str) -> Result<String, ToolError> {
        let data = self
            .api_get(
                language,
                &[
                    ("action", "query".to_string()),
                    ("list", "search".to_string()),
                    ("srsearch", query.to_string()),
                    ("utf8", "1".to_string()),
                    ("format", "json".to_string()),
                    ("srlimit", RESULT_LIMIT.to_string()),
                ],
            )
            .await?;
        let hits = data["query"]["search"].as_array().cloned().unwrap_or_default();
        if hits.is_empty() {
            return Ok("No Wikipedia results found.".to_string());
        }

        let page_ids: Vec<String> = hits
            .iter()
            .filter_map(|h| h["pageid"].as_i64())
            .map(|id| id.to_string())
            .collect();
        let extracts = self
            .api_get(
                language,
                &[
                    ("action", "query".to_string()),
                    ("prop", "extracts".to_string()),
                    ("exintro", "1".to_string()),
                    ("explaintext", "1".to_string()),
                    ("pageids", page_ids.join("|")),
                    ("format", "json".to_string()),
                ],
            )
            .await?;
        let pages = &extracts["query"]["pages"];

        let mut lines = Vec::new();
        for (i, hit) in hits.iter().enumerate() {
            let Some(page_id) = hit["pageid"].as_i64() else { continue };
            let title = hit["title"].as_str().unwrap_or("");
            let url = format!(
                "https://{language}.wikipedia.org/wiki/{}",
                url::form_urlencoded::byte_serialize(title.replace(' ', "_").as_bytes())
                    .collect::<String>()
            );
            let mut extract = pages[page_id.to_string()]["extract"].as_str().unwrap_or("").to_string();
            if extract.chars().count() > MAX_SUMMARY_LEN {
                let cut: String = extract.chars().take(MAX_SUMMARY_LEN).collect();
                extract = match cut.rfind(' ') {
                    Some(pos) => format!("{}…", &cut[..pos]),
                    None => format!("{cut}…"),
                };
            }
            lines.push(format!("{}. {title}\n   {url}\n   {extract}", i + 1));
        }
        Ok(lines.join("\n\n"))
    }
}

impl Default for WikipediaTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WikipediaTool {
    fn name(&self) -> &'static str {
        "wikipedia"
    }

    fn definitions(&self) -> Vec<Value> {
        vec![json!({
            "type": "function",
            "function": {
                "name": "wikipedia_search",
                "description": "Search Wikipedia for encyclopedic knowledge. Returns article titles, URLs and summaries.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "The search query" },
                        "language": {
                            "type": "string",
                            "description": "Language for Wikipedia search. Defaults to 'en'.",
                            "enum": ["en", "zh"],
                            "default": "en"
                        }
                    },
                    "required": ["query"]
                }
            }
        })]
    }

    async fn execute(&self, user_id: i64, _tool_name: &str, arguments: &Value) -> Option<String> {
        let query = arguments["query"].as_str().unwrap_or("").trim();
        if query.is_empty() {
            return Some("No query provided.".to_string());
        }
        let language = match arguments["language"].as_str() {
            Some(lang @ ("en" | "zh")) => lang,
            _ => "en",
        };
        Some(match self.search_and_summarize(query, language).await {
            Ok(text) => text,
            Err(e) => {
                warn!(user_id, query, "wikipedia_search failed: {e}");
                e.to_string()
            }
        })
    }

    fn instruction(&self) -> &'static str {
        "\n\nYou have the wikipedia_search tool to look up encyclopedic knowledge on Wikipedia.\n\
         Use it when the user asks about factual or encyclopedic topics.\n\
         You can specify language: 'en' (English, default) or 'zh' (Chinese)."
    }
}
