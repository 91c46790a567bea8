//! The streaming chat pipeline.
//!
//! One call handles one logical user turn: preflight gates, context pinning,
//! the bounded tool-call loop with throttled message edits, thinking
//! filtering, post-processing, delivery, persistence and token accounting.
//! Many turns run concurrently; each writes only to the persona and session
//! captured at its start.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Local;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::ai::{ChatClient, StreamChunk, ToolCall, Usage};
use crate::config::{MAX_MESSAGE_LENGTH, MAX_TOOL_ROUNDS, STREAM_UPDATE_INTERVAL};
use crate::error::BotError;
use crate::filters::filter_thinking_content;
use crate::services::Services;
use crate::telegram::{Message, TelegramClient};
use crate::tools::{ToolRegistry, TtsTool};

const LATEX_NOTE: &str = "\n\nIMPORTANT: Do NOT use LaTeX math notation ($...$ or $$...$$) in your \
responses. Telegram cannot render LaTeX. Instead, use plain text and Unicode symbols for math: \
use × instead of \\times, ÷ instead of \\div, √ instead of \\sqrt, use a/b instead of \
\\frac{a}{b}, use superscript characters (²³) and subscript characters (₁₂) when possible, \
use → ≤ ≥ ≠ ≈ ∞ π α β etc. directly.";

/// One logical user turn, already cleaned by the router (mention stripping,
/// group gating, media aggregation).
pub struct TurnInput {
    pub user_id: i64,
    pub chat_id: i64,
    pub reply_to: i64,
    /// Content for the LLM: a string or a multimodal part array.
    pub user_content: Value,
    /// Text recorded in conversation history for this turn.
    pub save_msg: String,
    /// Query used for semantic memory retrieval.
    pub query_text: String,
}

pub struct ChatPipeline {
    services: Arc<Services>,
    registry: Arc<ToolRegistry>,
    telegram: TelegramClient,
    tts: Arc<TtsTool>,
}

struct RoundResult {
    text: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<String>,
}

impl ChatPipeline {
    pub fn new(
        services: Arc<Services>,
        registry: Arc<ToolRegistry>,
        telegram: TelegramClient,
        tts: Arc<TtsTool>,
    ) -> Arc<Self> {
        Arc::new(Self { services, registry, telegram, tts })
    }

    /// Build a turn from a plain text message.
    pub fn text_turn(&self, message: &Message, text: String) -> TurnInput {
        let user_id = message.from.as_ref().map(|u| u.id).unwrap_or(message.chat.id);
        TurnInput {
            user_id,
            chat_id: message.chat.id,
            reply_to: message.message_id,
            user_content: Value::String(text.clone()),
            save_msg: text.clone(),
            query_text: text,
        }
    }

    /// Aggregate a media group (or a single photo) into one multimodal turn.
    pub async fn photo_turn(&self, messages: &[Message], caption: String) -> Result<TurnInput> {
        let first = messages.first().context("empty media group")?;
        let user_id = first.from.as_ref().map(|u| u.id).unwrap_or(first.chat.id);

        let mut parts = Vec::new();
        if !caption.is_empty() {
            parts.push(json!({ "type": "text", "text": caption }));
        }
        for message in messages {
            let Some(photos) = &message.photo else { continue };
            // Sizes are ordered smallest first; take the best quality.
            let Some(photo) = photos.last() else { continue };
            let data = self.download(&photo.file_id).await?;
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{}", BASE64.encode(&data)) },
            }));
        }

        let mut save_msg = "[Image]".to_string();
        if !caption.is_empty() {
            save_msg.push(' ');
            save_msg.push_str(&caption);
        }
        Ok(TurnInput {
            user_id,
            chat_id: first.chat.id,
            reply_to: first.message_id,
            user_content: Value::Array(parts),
            save_msg,
            query_text: caption,
        })
    }

    /// An image sent as a document (uncompressed) becomes a vision turn.
    pub async fn photo_document_turn(
        &self,
        message: &Message,
        document: &crate::telegram::Document,
        extension: &str,
        caption: String,
    ) -> Result<TurnInput> {
        let user_id = message.from.as_ref().map(|u| u.id).unwrap_or(message.chat.id);
        let data = self.download(&document.file_id).await?;
        let mime = match extension {
            "jpg" | "jpeg" => "jpeg",
            other => other,
        };

        let mut parts = Vec::new();
        if !caption.is_empty() {
            parts.push(json!({ "type": "text", "text": caption }));
        }
        parts.push(json!({
            "type": "image_url",
            "image_url": { "url": format!("data:image/{mime};base64,{}", BASE64.encode(&data)) },
        }));

        let mut save_msg = "[Image]".to_string();
        if !caption.is_empty() {
            save_msg.push(' ');
            save_msg.push_str(&caption);
        }
        Ok(TurnInput {
            user_id,
            chat_id: message.chat.id,
            reply_to: message.message_id,
            user_content: Value::Array(parts),
            save_msg,
            query_text: caption,
        })
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let info = self.telegram.get_file(file_id).await.context("getFile failed")?;
        let path = info.file_path.context("file has no path")?;
        Ok(self.telegram.download_file(&path).await.context("file download failed")?)
    }

    /// Run a turn end to end. All failures are reported to the user as the
    /// generic retry text; details go to the log only.
    pub async fn run_turn(self: &Arc<Self>, input: TurnInput) {
        let user_id = input.user_id;
        let settings = self.services.get_user_settings(user_id);

        if settings.api_key.is_empty() {
            self.reply(&input, &BotError::ConfigMissing.user_text()).await;
            return;
        }
        if matches!(self.services.get_remaining_tokens(user_id), Some(remaining) if remaining <= 0) {
            self.reply(&input, &BotError::QuotaExceeded.user_text()).await;
            return;
        }

        let _ = self.telegram.send_chat_action(input.chat_id, "typing").await;
        let placeholder = match self
            .telegram
            .send_message(input.chat_id, "…", None, Some(input.reply_to))
            .await
        {
            Ok(message) => message,
            Err(e) => {
                error!(user_id, "failed to send placeholder: {e}");
                return;
            }
        };

        // Pin the turn's context: every read and write below targets this
        // persona and session, even if the user switches mid-stream.
        let persona_name = self.services.get_current_persona_name(user_id);
        let session_id = self.services.ensure_session(user_id, &persona_name);

        if let Err(e) = self
            .run_pinned_turn(&input, &persona_name, session_id, placeholder.message_id)
            .await
        {
            error!(user_id, persona = %persona_name, session_id, "chat turn failed: {e:#}");
            let _ = self
                .telegram
                .edit_message_safe(input.chat_id, placeholder.message_id, "Error. Please retry.")
                .await;
        }
    }

    async fn run_pinned_turn(
        self: &Arc<Self>,
        input: &TurnInput,
        persona_name: &str,
        session_id: i64,
        placeholder_id: i64,
    ) -> Result<()> {
        let user_id = input.user_id;
        let settings = self.services.get_user_settings(user_id);
        let enabled_tools = settings.enabled_tools.clone();
        let client = ChatClient::new(&settings.api_key, &settings.base_url);

        let mut system_prompt = self.services.get_system_prompt(user_id);
        system_prompt.push_str(&format!(
            "\n\nCurrent date and time: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S (%A)")
        ));
        system_prompt = self
            .registry
            .enrich_system_prompt(user_id, system_prompt, &enabled_tools, Some(&input.query_text))
            .await;
        system_prompt.push_str(&self.registry.get_instructions(&enabled_tools));
        system_prompt.push_str(LATEX_NOTE);

        let mut messages: Vec<Value> = vec![json!({ "role": "system", "content": system_prompt })];
        for message in self.services.get_conversation(session_id) {
            messages.push(json!({ "role": message.role, "content": message.content }));
        }
        messages.push(json!({ "role": "user", "content": input.user_content }));

        let tools = self.registry.get_definitions(&enabled_tools);
        let tools = if tools.is_empty() { None } else { Some(tools) };

        let mut last_usage: Option<Usage> = None;
        let mut last_text_response = String::new();
        let mut truncated_prefix = String::new();
        let mut seen_tool_keys: HashSet<String> = HashSet::new();
        let mut tool_results_pending = false;
        let mut round_result = RoundResult {
            text: String::new(),
            tool_calls: Vec::new(),
            finish_reason: None,
        };

        for round in 0..=MAX_TOOL_ROUNDS {
            round_result = self
                .stream_round(
                    &client,
                    &messages,
                    &settings.model,
                    settings.temperature,
                    tools.as_deref(),
                    input.chat_id,
                    placeholder_id,
                    &mut last_usage,
                )
                .await?;
            tool_results_pending = false;

            if !round_result.text.trim().is_empty() {
                last_text_response = round_result.text.clone();
            }

            if round_result.tool_calls.is_empty() {
                // Output-limit truncation: ask the model to continue and
                // stitch the pieces together afterwards.
                if round_result.finish_reason.as_deref() == Some("length") && round < MAX_TOOL_ROUNDS {
                    info!(user_id, "response truncated, requesting continuation");
                    truncated_prefix.push_str(&round_result.text);
                    messages.push(json!({ "role": "assistant", "content": round_result.text }));
                    messages.push(json!({
                        "role": "user",
                        "content": "Please continue and complete your response concisely.",
                    }));
                    continue;
                }
                break;
            }

            self.show_tool_status(input.chat_id, placeholder_id, &round_result).await;

            // Skip tool calls repeating an operation already executed this
            // turn; the model is pointed at the earlier result instead.
            let mut duplicate_ids = HashSet::new();
            let mut fresh_calls = Vec::new();
            for call in &round_result.tool_calls {
                let key = tool_dedup_key(call);
                if seen_tool_keys.insert(key) {
                    fresh_calls.push(call.clone());
                } else {
                    duplicate_ids.insert(call.id.clone());
                }
            }

            let executed = self
                .registry
                .process_tool_calls(user_id, &fresh_calls, &enabled_tools)
                .await;

            let mut tool_results = Vec::new();
            let mut executed_iter = executed.into_iter();
            for call in &round_result.tool_calls {
                if duplicate_ids.contains(&call.id) {
                    tool_results.push(json!({
                        "role": "tool",
                        "tool_call_id": call.id,
                        "content": "Already called with the same target. The result is in the \
                                    conversation above. Please use it directly.",
                    }));
                } else if let Some(result) = executed_iter.next() {
                    tool_results.push(result);
                }
            }

            if tool_results.is_empty() {
                // Every call was fire-and-forget; nothing for the model to
                // read back, so stop looping.
                break;
            }

            messages.push(json!({
                "role": "assistant",
                "content": if round_result.text.is_empty() { Value::Null } else { Value::String(round_result.text.clone()) },
                "tool_calls": round_result.tool_calls.iter().map(|call| json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                })).collect::<Vec<_>>(),
            }));
            messages.extend(tool_results);
            tool_results_pending = true;
        }

        // All tool rounds used with unconsumed tool results: one final call
        // without tools to force a text reply.
        if tool_results_pending {
            round_result = self
                .stream_round(
                    &client,
                    &messages,
                    &settings.model,
                    settings.temperature,
                    None,
                    input.chat_id,
                    placeholder_id,
                    &mut last_usage,
                )
                .await?;
            if !round_result.text.trim().is_empty() {
                last_text_response = round_result.text.clone();
            }
        }

        self.deliver_pending_voices(input).await;

        let combined = format!("{truncated_prefix}{}", round_result.text);
        let mut final_text = filter_thinking_content(&combined, false);
        if final_text.is_empty() && !last_text_response.is_empty() {
            final_text = filter_thinking_content(&last_text_response, false);
        }
        final_text = self.registry.post_process(user_id, final_text, &enabled_tools).await;
        if final_text.is_empty() {
            final_text = "(Empty response)".to_string();
        }

        if final_text.chars().count() > MAX_MESSAGE_LENGTH {
            let _ = self.telegram.delete_message(input.chat_id, placeholder_id).await;
            self.telegram
                .send_message_safe(input.chat_id, &final_text, Some(input.reply_to))
                .await;
        } else {
            let edited = self
                .telegram
                .edit_message_safe(input.chat_id, placeholder_id, &final_text)
                .await;
            if !edited {
                let _ = self.telegram.delete_message(input.chat_id, placeholder_id).await;
                self.telegram
                    .send_message_safe(input.chat_id, &final_text, Some(input.reply_to))
                    .await;
            }
        }

        self.services.add_user_message_to_session(session_id, &input.save_msg);
        self.services.add_assistant_message_to_session(session_id, &final_text);

        if self.services.session_message_count(session_id) <= 2 {
            let services = self.services.clone();
            let save_msg = input.save_msg.clone();
            let reply = final_text.clone();
            tokio::spawn(async move {
                match services.generate_session_title(user_id, &save_msg, &reply).await {
                    Ok(Some(title)) => {
                        services.set_session_title(session_id, &title);
                        info!(user_id, session_id, %title, "auto-generated session title");
                    }
                    Ok(None) => {}
                    Err(e) => warn!(user_id, "session title generation failed: {e}"),
                }
            });
        }

        if let Some(usage) = last_usage {
            self.services.add_token_usage(
                user_id,
                persona_name,
                usage.prompt_tokens,
                usage.completion_tokens,
            );
        }

        Ok(())
    }

    /// Consume one LLM stream, editing the placeholder with partial output.
    /// Edits are throttled to one per [`STREAM_UPDATE_INTERVAL`], except the
    /// first visible chunk; while only reasoning flows the placeholder shows
    /// a thinking indicator.
    #[allow(clippy::too_many_arguments)]
    async fn stream_round(
        &self,
        client: &ChatClient,
        messages: &[Value],
        model: &str,
        temperature: f64,
        tools: Option<&[Value]>,
        chat_id: i64,
        placeholder_id: i64,
        last_usage: &mut Option<Usage>,
    ) -> Result<RoundResult> {
        let (tools_dropped, mut stream) =
            client.chat_stream(messages, model, temperature, tools).await?;
        if tools_dropped {
            info!("backend does not support tools; continuing without them");
        }

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut finish_reason = None;
        let mut first_visible = true;
        let mut thinking_shown = false;
        let mut last_edit = Instant::now();
        let mut last_len = 0usize;

        while let Some(chunk) = stream.next().await {
            let chunk: StreamChunk = chunk?;

            if let Some(usage) = chunk.usage {
                *last_usage = Some(usage);
            }

            if chunk.reasoning.is_some() && !thinking_shown && text.is_empty() {
                thinking_shown = true;
                let _ = self.telegram.edit_message_safe(chat_id, placeholder_id, "Thinking…").await;
            }

            if let Some(content) = &chunk.content {
                text.push_str(content);
                let display = filter_thinking_content(&text, true);
                if display.is_empty() {
                    // Inline <think> tag opened; everything is hidden so far.
                    if !thinking_shown && !text.trim().is_empty() {
                        thinking_shown = true;
                        let _ = self
                            .telegram
                            .edit_message_safe(chat_id, placeholder_id, "Thinking…")
                            .await;
                    }
                } else if first_visible
                    || (last_edit.elapsed() >= STREAM_UPDATE_INTERVAL
                        && display.chars().count() > last_len)
                {
                    first_visible = false;
                    last_edit = Instant::now();
                    last_len = display.chars().count();
                    let _ = self
                        .telegram
                        .edit_message_safe(chat_id, placeholder_id, &format!("{display} ▌"))
                        .await;
                }
            }

            if chunk.finished {
                finish_reason = chunk.finish_reason.clone();
                tool_calls.extend(chunk.tool_calls);
            }
        }

        Ok(RoundResult { text, tool_calls, finish_reason })
    }

    async fn show_tool_status(&self, chat_id: i64, placeholder_id: i64, round: &RoundResult) {
        let status: Vec<String> =
            round.tool_calls.iter().map(|call| tool_status_line(&call.name)).collect();
        let display = filter_thinking_content(&round.text, true);
        let text = if display.is_empty() {
            status.join("\n")
        } else {
            format!("{display}\n\n{}", status.join("\n"))
        };
        let _ = self.telegram.edit_message_safe(chat_id, placeholder_id, &text).await;
    }

    async fn deliver_pending_voices(&self, input: &TurnInput) {
        for job in self.tts.drain_pending(input.user_id) {
            if job.audio.is_empty() {
                continue;
            }
            if let Err(e) = self
                .telegram
                .send_voice(input.chat_id, job.audio, &job.filename, job.caption.as_deref())
                .await
            {
                error!(user_id = input.user_id, "failed to send pending voice: {e}");
            }
        }
    }

    async fn reply(&self, input: &TurnInput, text: &str) {
        if let Err(e) = self
            .telegram
            .send_message(input.chat_id, text, None, Some(input.reply_to))
            .await
        {
            error!(user_id = input.user_id, "failed to send reply: {e}");
        }
    }

    /// `/retry`: drop the last exchange from the pinned session and re-run
    /// the pipeline with the same user content.
    pub async fn retry(self: &Arc<Self>, message: &Message) {
        let user_id = message.from.as_ref().map(|u| u.id).unwrap_or(message.chat.id);
        let persona_name = self.services.get_current_persona_name(user_id);
        let session_id = self.services.ensure_session(user_id, &persona_name);

        let conversation = self.services.get_conversation(session_id);
        let Some(last_user) = conversation.iter().rev().find(|m| m.role == "user") else {
            let _ = self
                .telegram
                .send_message(message.chat.id, "No previous message to retry.", None, Some(message.message_id))
                .await;
            return;
        };
        let content = last_user.content.clone();
        self.services.pop_last_exchange(session_id);

        let input = TurnInput {
            user_id,
            chat_id: message.chat.id,
            reply_to: message.message_id,
            user_content: Value::String(content.clone()),
            save_msg: content.clone(),
            query_text: content,
        };
        self.run_turn(input).await;
    }
}

fn tool_status_line(name: &str) -> String {
    match name {
        "web_search" => "🔍 Searching...".to_string(),
        "url_fetch" => "🌐 Fetching page...".to_string(),
        "save_memory" => "💾 Saving to memory...".to_string(),
        "tts_speak" => "🎤 Generating voice...".to_string(),
        "tts_list_voices" => "🎙️ Loading voices...".to_string(),
        "wikipedia_search" => "📚 Searching Wikipedia...".to_string(),
        other => format!("⚙️ Running {other}..."),
    }
}

/// Dedup key: tool name plus its primary argument, so the same fetch or
/// search is not executed twice in one turn.
fn tool_dedup_key(call: &ToolCall) -> String {
    let Ok(arguments) = serde_json::from_str::<Value>(&call.arguments) else {
        return format!("{}:{}", call.name, call.arguments);
    };
    match call.name.as_str() {
        "url_fetch" => format!("url_fetch:{}", arguments["url"].as_str().unwrap_or("")),
        "web_search" => format!("web_search:{}", arguments["query"].as_str().unwrap_or("")),
        _ => format!("{}:{}", call.name, call.arguments),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall { id: "x".into(), name: name.into(), arguments: arguments.into() }
    }

    #[test]
    fn dedup_key_ignores_secondary_fetch_arguments() {
        let a = call("url_fetch", r#"{"url":"https://a.com","max_length":5000}"#);
        let b = call("url_fetch", r#"{"url":"https://a.com","method":"jina"}"#);
        assert_eq!(tool_dedup_key(&a), tool_dedup_key(&b));
    }

    #[test]
    fn dedup_key_separates_different_queries() {
        let a = call("web_search", r#"{"query":"rust"}"#);
        let b = call("web_search", r#"{"query":"go"}"#);
        assert_ne!(tool_dedup_key(&a), tool_dedup_key(&b));
    }

    #[test]
    fn dedup_key_uses_full_arguments_for_other_tools() {
        let a = call("wikipedia_search", r#"{"query":"rust","language":"en"}"#);
        let b = call("wikipedia_search", r#"{"query":"rust","language":"zh"}"#);
        assert_ne!(tool_dedup_key(&a), tool_dedup_key(&b));
    }
}
