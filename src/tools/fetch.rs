//! URL fetch tool with a mandatory SSRF gate.
//!
//! Every target (and every redirect hop) is validated before any outbound
//! request: scheme allowlist, hostname blocklist, and address-range checks on
//! IP literals and resolved addresses. Rejection happens before a single
//! body byte is read.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde_json::{json, Value};
use tracing::warn;

use super::{Tool, ToolError};

const DEFAULT_MAX_LENGTH: usize = 5000;
const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const HOST_BLOCKLIST: &[&str] = &["localhost", "metadata.google.internal", "metadata", "instance-data"];

pub struct FetchTool {
    client: reqwest::Client,
    jina_key: Option<String>,
}

impl FetchTool {
    pub fn new(jina_key: Option<String>) -> Self {
        Self {
            // Redirects are followed manually so each hop passes the gate.
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(Duration::from_secs(30))
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
            jina_key,
        }
    }

    async fn fetch_direct(&self, url: &str, max_length: usize) -> Result<String, ToolError> {
        let mut url = validate_url(url).await?;
        let mut response = None;

        for _ in 0..=MAX_REDIRECTS {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| ToolError::FetchFailed(e.to_string()))?;

            if resp.status().is_redirection() {
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| ToolError::FetchFailed("redirect without location".to_string()))?;
                let next = url
                    .join(location)
                    .map_err(|e| ToolError::FetchFailed(format!("bad redirect target: {e}")))?;
                url = validate_url(next.as_str()).await?;
                continue;
            }
            response = Some(resp);
            break;
        }

        let resp = response.ok_or_else(|| ToolError::FetchFailed("too many redirects".to_string()))?;
        let status = resp.status();
        if status.as_u16() == 403 {
            return Err(ToolError::FetchFailed(
                "HTTP 403 Forbidden (likely blocked by WAF)".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(ToolError::FetchFailed(format!("HTTP {status}")));
        }

        let mut content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body = resp.text().await.map_err(|e| ToolError::FetchFailed(e.to_string()))?;

        // Detect HTML when the content-type header is missing.
        let head = body.trim_start().chars().take(15).collect::<String>().to_lowercase();
        if content_type.is_empty() && (head.starts_with("<!doctype html") || head.starts_with("<html")) {
            content_type = "text/html".to_string();
        }

        let text = if content_type.contains("application/json") {
            match serde_json::from_str::<Value>(&body) {
                Ok(value) => serde_json::to_string_pretty(&value).unwrap_or(body),
                Err(_) => body,
            }
        } else if content_type.contains("text/html") {
            let extracted = extract_article(&body);
            if extracted.is_empty() { body } else { extracted }
        } else if content_type.starts_with("text/") {
            body
        } else {
            return Err(ToolError::FetchFailed(format!("Unsupported content type: {content_type}")));
        };

        Ok(truncate(&text, max_length))
    }

    async fn fetch_jina(&self, url: &str, max_length: usize) -> Result<String, ToolError> {
        validate_url(url).await?;
        let key = self
            .jina_key
            .as_ref()
            .ok_or_else(|| ToolError::FetchFailed("JINA_API_KEY not configured".to_string()))?;

        let resp = self
            .client
            .post("https://r.jina.ai/")
            .bearer_auth(key)
            .header("Accept", "application/json")
            .header("X-Return-Format", "markdown")
            .json(&json!({ "url": url }))
            .send()
            .await
            .map_err(|e| ToolError::FetchFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ToolError::FetchFailed(format!("Jina API HTTP {}", resp.status())));
        }

        let value: Value = resp.json().await.map_err(|e| ToolError::FetchFailed(e.to_string()))?;
        let data = &value["data"];
        let title = data["title"].as_str().unwrap_or("");
        let content = data["content"].as_str().unwrap_or("");
        if content.is_empty() {
            return Err(ToolError::FetchFailed("Jina returned empty content".to_string()));
        }
        let text = if title.is_empty() {
            content.to_string()
        } else {
            format!("# {title}\n\n{content}")
        };
        Ok(truncate(&text, max_length))
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn definitions(&self) -> Vec<Value> {
        vec![json!({
            "type": "function",
            "function": {
                "name": "url_fetch",
                "description": "Fetch content from a URL. \
                    Use method='jina' for complex/JS-heavy pages (returns clean markdown). \
                    Default method is faster for simple pages and API endpoints.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "The URL to fetch" },
                        "method": {
                            "type": "string",
                            "enum": ["default", "jina"],
                            "default": "default",
                            "description": "'default' = direct request + text extraction. \
                                'jina' = Jina Reader API, better for JS-heavy or complex pages."
                        },
                        "max_length": {
                            "type": "integer",
                            "description": "Maximum characters to return (default 5000)",
                            "default": 5000
                        }
                    },
                    "required": ["url"]
                }
            }
        })]
    }

    async fn execute(&self, user_id: i64, _tool_name: &str, arguments: &Value) -> Option<String> {
        let url = arguments["url"].as_str().unwrap_or("").trim();
        if url.is_empty() {
            return Some("No URL provided.".to_string());
        }
        let method = arguments["method"].as_str().unwrap_or("default").trim().to_lowercase();
        let max_length = arguments["max_length"].as_u64().unwrap_or(DEFAULT_MAX_LENGTH as u64) as usize;

        let result = if method == "jina" {
            self.fetch_jina(url, max_length).await
        } else {
            self.fetch_direct(url, max_length).await
        };

        Some(match result {
            Ok(text) => text,
            Err(e) => {
                warn!(user_id, url, "url_fetch failed: {e}");
                e.to_string()
            }
        })
    }

    fn instruction(&self) -> &'static str {
        "\n\nYou have the url_fetch tool to retrieve content from URLs.\n\
         Use it when you need to read a web page or API endpoint.\n\
         Use method='jina' for complex/JS-heavy pages (returns clean markdown).\n\
         Default method is faster for simple pages.\n"
    }
}

/// The SSRF gate. Returns the parsed URL only when scheme, hostname, and the
/// address it maps to are all acceptable for an outbound request.
pub async fn validate_url(raw: &str) -> Result<Url, ToolError> {
    let url = Url::parse(raw).map_err(|_| ToolError::UrlRejected("invalid URL".to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ToolError::UrlRejected(format!("scheme '{}' not allowed", url.scheme())));
    }

    match url.host() {
        None => Err(ToolError::UrlRejected("missing host".to_string())),
        Some(url::Host::Ipv6(_)) => {
            Err(ToolError::UrlRejected("IPv6 address literals are not allowed".to_string()))
        }
        Some(url::Host::Ipv4(addr)) => {
            if is_forbidden_address(IpAddr::V4(addr)) {
                Err(ToolError::UrlRejected("address is in a restricted range".to_string()))
            } else {
                Ok(url)
            }
        }
        Some(url::Host::Domain(domain)) => {
            let host = domain.to_lowercase();
            if HOST_BLOCKLIST.contains(&host.as_str()) || host.ends_with(".local") {
                return Err(ToolError::UrlRejected(format!("host '{host}' is not allowed")));
            }
            let port = url.port_or_known_default().unwrap_or(443);
            let resolved = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|_| ToolError::UrlRejected(format!("cannot resolve host '{host}'")))?;
            let mut any = false;
            for addr in resolved {
                any = true;
                if is_forbidden_address(addr.ip()) {
                    return Err(ToolError::UrlRejected(format!(
                        "host '{host}' resolves to a restricted address"
                    )));
                }
            }
            if !any {
                return Err(ToolError::UrlRejected(format!("cannot resolve host '{host}'")));
            }
            Ok(url)
        }
    }
}

/// Loopback, link-local (incl. the cloud metadata address), RFC1918 private,
/// multicast, unspecified, and their IPv6 counterparts.
fn is_forbidden_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.octets() == [169, 254, 169, 254]
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_forbidden_address(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || (segments[0] & 0xfe00) == 0xfc00 // unique-local fc00::/7
                || (segments[0] & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}

static SCRIPT_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").unwrap());
static BLOCK_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(p|div|li|h[1-6]|tr|section|article)>|<br\s*/?>").unwrap());
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(article|main)[^>]*>(.*?)</(article|main)>").unwrap());
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Plain-text article extraction: prefer `<article>`/`<main>`, drop scripts
/// and markup, keep block boundaries as newlines.
fn extract_article(html: &str) -> String {
    let scoped = ARTICLE
        .captures(html)
        .map(|caps| caps[2].to_string())
        .unwrap_or_else(|| html.to_string());
    let cleaned = SCRIPT_STYLE.replace_all(&scoped, "");
    let broken = BLOCK_BREAK.replace_all(&cleaned, "\n");
    let text = ANY_TAG.replace_all(&broken, " ");
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    let lines: Vec<String> = text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    BLANK_RUNS.replace_all(lines.join("\n").trim(), "\n\n").into_owned()
}

fn truncate(text: &str, max_length: usize) -> String {
    if text.chars().count() <= max_length {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_length).collect();
    out.push_str("\n...(truncated)");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn rejected(url: &str) -> bool {
        matches!(validate_url(url).await, Err(ToolError::UrlRejected(_)))
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        assert!(rejected("ftp://example.com/file").await);
        assert!(rejected("file:///etc/passwd").await);
        assert!(rejected("gopher://example.com").await);
    }

    #[tokio::test]
    async fn rejects_loopback_addresses() {
        assert!(rejected("http://127.0.0.1/").await);
        assert!(rejected("http://127.8.8.8:8080/admin").await);
        assert!(rejected("http://[::1]/").await);
    }

    #[tokio::test]
    async fn rejects_private_ranges() {
        assert!(rejected("http://10.0.0.5/").await);
        assert!(rejected("http://172.16.1.1/").await);
        assert!(rejected("http://192.168.1.1/router").await);
    }

    #[tokio::test]
    async fn rejects_cloud_metadata_address() {
        assert!(rejected("http://169.254.169.254/latest/meta-data/").await);
    }

    #[tokio::test]
    async fn rejects_link_local_and_multicast() {
        assert!(rejected("http://169.254.0.1/").await);
        assert!(rejected("http://224.0.0.1/").await);
    }

    #[tokio::test]
    async fn rejects_localhost_and_dot_local_names() {
        assert!(rejected("http://localhost/").await);
        assert!(rejected("http://localhost:8080/health").await);
        assert!(rejected("http://printer.local/").await);
    }

    #[tokio::test]
    async fn allows_public_ip_literals() {
        assert!(validate_url("https://93.184.216.34/").await.is_ok());
    }

    #[test]
    fn forbidden_ranges_cover_ipv6_unique_local() {
        assert!(is_forbidden_address("fc00::1".parse().unwrap()));
        assert!(is_forbidden_address("fe80::1".parse().unwrap()));
        assert!(!is_forbidden_address("2606:2800:220:1:248:1893:25c8:1946".parse().unwrap()));
    }

    #[test]
    fn extract_article_prefers_article_element() {
        let html = "<html><head><script>nope()</script></head><body>\
            <nav>menu</nav><article><h1>Title</h1><p>First para.</p><p>Second.</p></article></body></html>";
        let text = extract_article(html);
        assert!(text.contains("Title"));
        assert!(text.contains("First para."));
        assert!(!text.contains("menu"));
        assert!(!text.contains("nope"));
    }

    #[test]
    fn truncation_appends_marker() {
        let text = "x".repeat(100);
        let out = truncate(&text, 50);
        assert!(out.ends_with("...(truncated)"));
        assert!(out.starts_with(&"x".repeat(50)));
    }
}
