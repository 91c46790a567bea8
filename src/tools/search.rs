//! Web search tool: Browserless (Bing HTML scrape) and the Ollama search API.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use super::{Tool, ToolError};

const BROWSERLESS_BASE_URL: &str = "https://production-sfo.browserless.io";
const OLLAMA_BASE_URL: &str = "https://ollama.com";
const DEFAULT_MAX_RESULTS: usize = 5;

#[derive(Debug, Clone)]
struct SearchResult {
    provider: &'static str,
    title: String,
    url: String,
    snippet: String,
}

pub struct SearchTool {
    client: reqwest::Client,
    browserless_token: Option<String>,
    ollama_key: Option<String>,
}

impl SearchTool {
    pub fn new(browserless_token: Option<String>, ollama_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            browserless_token,
            ollama_key,
        }
    }

    async fn browserless_search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ToolError> {
        let token = self
            .browserless_token
            .as_ref()
            .ok_or_else(|| ToolError::SearchFailed("BROWSERLESS_API_TOKEN not configured".to_string()))?;

        let search_url = format!(
            "https://www.bing.com/search?q={}",
            url::form_urlencoded::byte_serialize(query.as_bytes()).collect::<String>()
        );
        let resp = self
            .client
            .post(format!("{BROWSERLESS_BASE_URL}/content"))
            .query(&[("token", token.as_str())])
            .json(&json!({
                "url": search_url,
                "gotoOptions": { "timeout": 25000, "waitUntil": "domcontentloaded" },
            }))
            .send()
            .await
            .map_err(|e| ToolError::SearchFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ToolError::SearchFailed(format!("Browserless HTTP {}", resp.status())));
        }
        let html = resp.text().await.map_err(|e| ToolError::SearchFailed(e.to_string()))?;
        Ok(parse_bing_results(&html, max_results))
    }

    async fn ollama_search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ToolError> {
        let key = self
            .ollama_key
            .as_ref()
            .ok_or_else(|| ToolError::SearchFailed("OLLAMA_API_KEY not configured".to_string()))?;

        let resp = self
            .client
            .post(format!("{OLLAMA_BASE_URL}/api/web_search"))
            .bearer_auth(key)
            .json(&json!({ "query": query, "max_results": max_results }))
            .send()
            .await
            .map_err(|e| ToolError::SearchFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ToolError::SearchFailed(format!("Ollama HTTP {}", resp.status())));
        }
        let value: Value = resp.json().await.map_err(|e| ToolError::SearchFailed(e.to_string()))?;

        let mut results = Vec::new();
        for item in value["results"].as_array().map(Vec::as_slice).unwrap_or_default() {
            let url = item["url"].as_str().unwrap_or("").trim();
            if !url.starts_with("http://") && !url.starts_with("https://") {
                continue;
            }
            results.push(SearchResult {
                provider: "ollama",
                title: clean_text(item["title"].as_str().unwrap_or(url)),
                url: url.to_string(),
                snippet: clean_text(item["content"].as_str().unwrap_or("")),
            });
            if results.len() >= max_results {
                break;
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &'static str {
        "search"
    }

    fn definitions(&self) -> Vec<Value> {
        vec![json!({
            "type": "function",
            "function": {
                "name": "web_search",
                "description": "Search the web for current information. Returns titles, URLs and snippets.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search query" },
                        "provider": {
                            "type": "string",
                            "enum": ["browserless", "ollama", "all"],
                            "default": "all",
                            "description": "Provider to use. 'all' uses both."
                        },
                        "max_results": {
                            "type": "integer",
                            "minimum": 1,
                            "maximum": 10,
                            "default": 5,
                            "description": "Max results to return (1-10)"
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

        let provider = arguments["provider"].as_str().unwrap_or("all").trim().to_lowercase();
        let targets: Vec<&str> = match provider.as_str() {
            // "all" quietly skips providers without credentials.
            "all" | "both" | "auto" => {
                let mut targets = Vec::new();
                if self.browserless_token.is_some() {
                    targets.push("browserless");
                }
                if self.ollama_key.is_some() {
                    targets.push("ollama");
                }
                if targets.is_empty() {
                    return Some("No search providers configured.".to_string());
                }
                targets
            }
            "browserless" => vec!["browserless"],
            "ollama" => vec!["ollama"],
            other => {
                return Some(format!("Unknown provider: {other}. Use 'browserless', 'ollama', or 'all'."))
            }
        };

        let max_results = arguments["max_results"]
            .as_u64()
            .map(|n| (n as usize).clamp(1, 10))
            .unwrap_or(DEFAULT_MAX_RESULTS);

        let mut all_results = Vec::new();
        let mut errors = Vec::new();
        for target in targets {
            let outcome = match target {
                "browserless" => self.browserless_search(query, max_results).await,
                _ => self.ollama_search(query, max_results).await,
            };
            match outcome {
                Ok(results) => all_results.extend(results),
                Err(e) => {
                    warn!(user_id, provider = target, query, "search provider failed: {e}");
                    errors.push(format!("{target}: {e}"));
                }
            }
        }

        // Deduplicate by URL across providers.
        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();
        for result in all_results {
            if seen.insert(result.url.to_lowercase()) {
                merged.push(result);
                if merged.len() >= max_results {
                    break;
                }
            }
        }

        if merged.is_empty() {
            let mut message = "No results found.".to_string();
            for error in &errors {
                message.push_str(&format!("\n- {error}"));
            }
            return Some(message);
        }

        let mut lines: Vec<String> = merged
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!("{}. [{}] {}\n   {}\n   {}", i + 1, r.provider, r.title, r.url, r.snippet)
            })
            .collect();
        if !errors.is_empty() {
            lines.push(format!("Warnings: {}", errors.join("; ")));
        }
        Some(lines.join("\n\n"))
    }

    fn instruction(&self) -> &'static str {
        "\n\nYou have the web_search tool to find information from the internet.\n\
         Use it when the user asks about current events or needs up-to-date information.\n\
         Set provider to 'browserless', 'ollama', or 'all' (default: both).\n\
         Search results only contain brief snippets. If you need the full content of a page, \
         use the url_fetch tool with the URL from the search results.\n"
    }
}

static RESULT_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<li\s+class="b_algo"[^>]*>"#).unwrap());
static FIRST_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<a[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap());
static SNIPPET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<p[^>]*>(.*?)</p>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

fn parse_bing_results(html: &str, max_results: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();
    let mut blocks = RESULT_BLOCK.split(html);
    blocks.next(); // prefix before the first result

    for block in blocks {
        let block = match block.find("<li ") {
            Some(end) if end > 0 => &block[..end],
            _ => block,
        };
        let Some(caps) = FIRST_LINK.captures(block) else { continue };
        let raw_href = unescape_entities(&caps[1]);
        let title = strip_tags(&caps[2]);
        if title.is_empty() {
            continue;
        }
        let url = resolve_bing_href(&raw_href);
        if url.is_empty() {
            continue;
        }
        let snippet = SNIPPET
            .captures(block)
            .map(|caps| strip_tags(&caps[1]))
            .unwrap_or_default();
        results.push(SearchResult { provider: "browserless", title, url, snippet });
        if results.len() >= max_results {
            break;
        }
    }
    results
}

/// Unwrap Bing's `/ck/a` redirect; the target is base64 in the `u` param
/// with an `a1` prefix.
fn resolve_bing_href(raw_href: &str) -> String {
    if let Ok(url) = url::Url::parse(raw_href) {
        for (key, value) in url.query_pairs() {
            if key == "u" && value.starts_with("a1") {
                let mut b64 = value[2..].to_string();
                while b64.len() % 4 != 0 {
                    b64.push('=');
                }
                if let Ok(bytes) = URL_SAFE.decode(b64.as_bytes()) {
                    let decoded = String::from_utf8_lossy(&bytes).into_owned();
                    if decoded.starts_with("http://") || decoded.starts_with("https://") {
                        return decoded;
                    }
                }
            }
            if (key == "url" || key == "target")
                && (value.starts_with("http://") || value.starts_with("https://"))
            {
                return value.into_owned();
            }
        }
    }
    if (raw_href.starts_with("http://") || raw_href.starts_with("https://"))
        && !raw_href.contains("/ck/a")
    {
        return raw_href.to_string();
    }
    String::new()
}

fn strip_tags(html: &str) -> String {
    clean_text(&unescape_entities(&TAG.replace_all(html, "")))
}

fn unescape_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bing_result_blocks() {
        let html = r#"<ol><li class="b_algo"><h2><a href="https://example.com/page">Example <b>Page</b></a></h2>
            <p>A snippet about the page.</p></li>
            <li class="b_algo"><a href="https://other.org/">Other</a><p>More text.</p></li></ol>"#;
        let results = parse_bing_results(html, 5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Example Page");
        assert_eq!(results[0].url, "https://example.com/page");
        assert_eq!(results[0].snippet, "A snippet about the page.");
    }

    #[test]
    fn unwraps_bing_redirect_urls() {
        let encoded = URL_SAFE.encode(b"https://target.example/path");
        let href = format!("https://www.bing.com/ck/a?u=a1{}&other=1", encoded.trim_end_matches('='));
        assert_eq!(resolve_bing_href(&href), "https://target.example/path");
    }

    #[test]
    fn direct_urls_pass_through() {
        assert_eq!(resolve_bing_href("https://plain.example/x"), "https://plain.example/x");
        assert_eq!(resolve_bing_href("https://www.bing.com/ck/a?junk=1"), "");
    }
}
