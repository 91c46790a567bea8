//! Streaming client for OpenAI-compatible chat backends.
//!
//! Tool-call fragments arrive keyed by index and are accumulated until the
//! model reports a finish reason; reasoning deltas are surfaced separately so
//! the pipeline can show a thinking indicator. When streaming with
//! `include_usage`, the usage record arrives in a trailing chunk after the
//! finish chunk, so the stream runs until `[DONE]`.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub usage: Option<Usage>,
    pub finished: bool,
    pub finish_reason: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    delta: Option<WireDelta>,
    message: Option<WireMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Deserialize, Default)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Per-request client bound to one user's api key and base URL.
pub struct ChatClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ChatClient {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        messages: &[Value],
        model: &str,
        temperature: f64,
        stream: bool,
        tools: Option<&[Value]>,
    ) -> Result<reqwest::Response> {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(tools) = tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools.to_vec());
            }
        }
        let resp = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("chat backend returned {status}: {text}");
        }
        Ok(resp)
    }

    /// Open a streaming completion. The returned flag is true when the
    /// backend rejected the `tools` parameter and the request was retried
    /// without it (one retry only).
    pub async fn chat_stream(
        &self,
        messages: &[Value],
        model: &str,
        temperature: f64,
        tools: Option<&[Value]>,
    ) -> Result<(bool, impl Stream<Item = Result<StreamChunk>> + Unpin)> {
        let mut tools_dropped = false;
        let resp = match self.send(messages, model, temperature, true, tools).await {
            Ok(resp) => resp,
            Err(e) if tools.is_some() && mentions_tools(&e) => {
                warn!("backend rejected tools, retrying without: {e}");
                tools_dropped = true;
                self.send(messages, model, temperature, true, None).await?
            }
            Err(e) => return Err(e),
        };

        let stream = try_stream! {
            let bytes = resp.bytes_stream();
            futures_util::pin_mut!(bytes);
            let mut buffer = String::new();
            let mut accumulators: BTreeMap<u32, (String, String, String)> = BTreeMap::new();
            while let Some(piece) = bytes.next().await {
                let piece = piece.context("stream read error")?;
                buffer.push_str(&String::from_utf8_lossy(&piece));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
                        return;
                    }
                    let Ok(wire) = serde_json::from_str::<WireChunk>(data) else {
                        continue;
                    };
                    if let Some(chunk) = assemble_chunk(wire, &mut accumulators) {
                        yield chunk;
                    }
                }
            }
        };
        Ok((tools_dropped, Box::pin(stream)))
    }

    /// Non-streaming completion; used for session-title generation.
    pub async fn chat(
        &self,
        messages: &[Value],
        model: &str,
        temperature: f64,
    ) -> Result<StreamChunk> {
        let resp = self.send(messages, model, temperature, false, None).await?;
        let wire: WireChunk = resp.json().await.context("failed to parse chat response")?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("chat response had no choices"))?;
        let message = choice.message.unwrap_or(WireMessage { content: None, tool_calls: None });
        Ok(StreamChunk {
            content: message.content,
            reasoning: None,
            usage: wire.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
            finished: true,
            finish_reason: choice.finish_reason,
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCall { id: tc.id, name: tc.function.name, arguments: tc.function.arguments })
                .collect(),
        })
    }

    /// List model ids; also used to validate a freshly-set api key.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("model list request failed")?;
        if !resp.status().is_success() {
            bail!("model list returned {}", resp.status());
        }
        let parsed: ModelsResponse = resp.json().await.context("failed to parse model list")?;
        let mut models: Vec<String> = parsed.data.into_iter().map(|m| m.id).collect();
        models.sort();
        Ok(models)
    }
}

fn mentions_tools(error: &anyhow::Error) -> bool {
    let text = format!("{error:#}").to_lowercase();
    text.contains("tool") || text.contains("function")
}

/// Fold one wire chunk into a [`StreamChunk`], updating the per-index
/// tool-call accumulators. Returns `None` for chunks carrying nothing.
fn assemble_chunk(
    wire: WireChunk,
    accumulators: &mut BTreeMap<u32, (String, String, String)>,
) -> Option<StreamChunk> {
    let usage = wire.usage.map(|u| Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
    });

    let mut content = None;
    let mut reasoning = None;
    let mut finish_reason = None;
    if let Some(choice) = wire.choices.into_iter().next() {
        finish_reason = choice.finish_reason;
        if let Some(delta) = choice.delta {
            content = delta.content.filter(|s| !s.is_empty());
            reasoning = delta
                .reasoning_content
                .or(delta.reasoning)
                .filter(|s| !s.is_empty());
            for tc in delta.tool_calls.unwrap_or_default() {
                let slot = accumulators.entry(tc.index).or_default();
                if let Some(id) = tc.id {
                    slot.0 = id;
                }
                if let Some(function) = tc.function {
                    if let Some(name) = function.name {
                        slot.1 = name;
                    }
                    if let Some(arguments) = function.arguments {
                        slot.2.push_str(&arguments);
                    }
                }
            }
        }
    }

    let finished = finish_reason.is_some();
    let tool_calls = if finished && !accumulators.is_empty() {
        std::mem::take(accumulators)
            .into_values()
            .filter(|(id, name, _)| !id.is_empty() && !name.is_empty())
            .map(|(id, name, arguments)| ToolCall { id, name, arguments })
            .collect()
    } else {
        Vec::new()
    };

    if content.is_some() || reasoning.is_some() || usage.is_some() || finished {
        Some(StreamChunk { content, reasoning, usage, finished, finish_reason, tool_calls })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(data: &str) -> WireChunk {
        serde_json::from_str(data).unwrap()
    }

    #[test]
    fn tool_call_fragments_assemble_on_finish() {
        let mut acc = BTreeMap::new();
        let first = wire(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"call_1","function":{"name":"web_search","arguments":"{\"qu"}}]}}]}"#,
        );
        assert!(assemble_chunk(first, &mut acc).is_none());
        let second = wire(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"arguments":"ery\":\"rust\"}"}}]}}]}"#,
        );
        assert!(assemble_chunk(second, &mut acc).is_none());
        let finish = wire(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        let chunk = assemble_chunk(finish, &mut acc).unwrap();
        assert!(chunk.finished);
        assert_eq!(chunk.tool_calls.len(), 1);
        assert_eq!(chunk.tool_calls[0].id, "call_1");
        assert_eq!(chunk.tool_calls[0].name, "web_search");
        assert_eq!(chunk.tool_calls[0].arguments, r#"{"query":"rust"}"#);
    }

    #[test]
    fn parallel_tool_calls_keep_index_order() {
        let mut acc = BTreeMap::new();
        let deltas = wire(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":1,"id":"b","function":{"name":"url_fetch","arguments":"{}"}},
                {"index":0,"id":"a","function":{"name":"web_search","arguments":"{}"}}]}}]}"#,
        );
        assert!(assemble_chunk(deltas, &mut acc).is_none());
        let finish = wire(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        let chunk = assemble_chunk(finish, &mut acc).unwrap();
        let ids: Vec<_> = chunk.tool_calls.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn reasoning_deltas_surface_without_content() {
        let mut acc = BTreeMap::new();
        let chunk = assemble_chunk(
            wire(r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#),
            &mut acc,
        )
        .unwrap();
        assert_eq!(chunk.reasoning.as_deref(), Some("hmm"));
        assert!(chunk.content.is_none());
        assert!(!chunk.finished);
    }

    #[test]
    fn trailing_usage_chunk_has_no_choices() {
        let mut acc = BTreeMap::new();
        let chunk = assemble_chunk(
            wire(r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34}}"#),
            &mut acc,
        )
        .unwrap();
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 34);
        assert!(!chunk.finished);
    }

    #[test]
    fn incomplete_tool_calls_are_dropped() {
        let mut acc = BTreeMap::new();
        assert!(assemble_chunk(
            wire(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{}"}}]}}]}"#),
            &mut acc,
        )
        .is_none());
        let finish = wire(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        let chunk = assemble_chunk(finish, &mut acc).unwrap();
        assert!(chunk.tool_calls.is_empty());
    }
}
