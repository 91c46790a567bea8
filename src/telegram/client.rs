//! Thin reqwest adapter for the Bot API: long polling plus the send, edit,
//! delete and upload primitives the pipeline needs.

use std::time::Duration;

use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use super::format::{markdown_to_telegram_html, split_message, truncate_for_edit};
use super::types::{FileInfo, Message, Update, User};
use crate::config::MAX_MESSAGE_LENGTH;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("telegram transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("telegram API error: {description}")]
    Api { description: String, retry_after: Option<u64> },
}

impl ApiError {
    pub fn is_not_modified(&self) -> bool {
        matches!(self, ApiError::Api { description, .. }
            if description.to_lowercase().contains("not modified"))
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    api_base: String,
    file_base: String,
}

impl TelegramClient {
    pub fn new(token: &str, api_base: Option<&str>) -> Self {
        let root = api_base.unwrap_or("https://api.telegram.org");
        Self {
            // Long polling holds the connection open for the poll timeout.
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(90))
                .build()
                .unwrap_or_default(),
            api_base: format!("{root}/bot{token}"),
            file_base: format!("{root}/file/bot{token}"),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, ApiError> {
        let resp = self
            .client
            .post(format!("{}/{method}", self.api_base))
            .json(&body)
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
        let parsed: ApiResponse<T> = resp.json().await?;
        if parsed.ok {
            parsed.result.ok_or_else(|| ApiError::Api {
                description: "missing result".to_string(),
                retry_after: None,
            })
        } else {
            Err(ApiError::Api {
                description: parsed.description.unwrap_or_else(|| "unknown error".to_string()),
                retry_after: parsed.parameters.and_then(|p| p.retry_after),
            })
        }
    }

    pub async fn get_me(&self) -> Result<User, ApiError> {
        self.call("getMe", json!({})).await
    }

    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, ApiError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
        reply_to: Option<i64>,
    ) -> Result<Message, ApiError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode);
        }
        if let Some(id) = reply_to {
            body["reply_parameters"] = json!({ "message_id": id });
        }
        self.call("sendMessage", body).await
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut body = json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode);
        }
        self.call::<Value>("editMessageText", body).await.map(|_| ())
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ApiError> {
        self.call::<Value>("deleteMessage", json!({ "chat_id": chat_id, "message_id": message_id }))
            .await
            .map(|_| ())
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), ApiError> {
        self.call::<Value>("sendChatAction", json!({ "chat_id": chat_id, "action": action }))
            .await
            .map(|_| ())
    }

    pub async fn send_voice(
        &self,
        chat_id: i64,
        audio: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<Message, ApiError> {
        let mut form = multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("voice", multipart::Part::bytes(audio).file_name(filename.to_string()));
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        let resp = self
            .client
            .post(format!("{}/sendVoice", self.api_base))
            .multipart(form)
            .send()
            .await?;
        Self::parse(resp).await
    }

    pub async fn send_document(
        &self,
        chat_id: i64,
        data: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<Message, ApiError> {
        let mut form = multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", multipart::Part::bytes(data).file_name(filename.to_string()));
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        let resp = self
            .client
            .post(format!("{}/sendDocument", self.api_base))
            .multipart(form)
            .send()
            .await?;
        Self::parse(resp).await
    }

    pub async fn get_file(&self, file_id: &str) -> Result<FileInfo, ApiError> {
        self.call("getFile", json!({ "file_id": file_id })).await
    }

    pub async fn download_file(&self, file_path: &str) -> Result<Vec<u8>, ApiError> {
        let resp = self
            .client
            .get(format!("{}/{file_path}", self.file_base))
            .send()
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Send with HTML formatting, splitting over the length limit; each chunk
    /// falls back to plain text when Telegram rejects the HTML.
    pub async fn send_message_safe(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Vec<Message> {
        let mut sent = Vec::new();
        for (i, chunk) in split_message(text, MAX_MESSAGE_LENGTH).into_iter().enumerate() {
            let reply = if i == 0 { reply_to } else { None };
            let html = markdown_to_telegram_html(&chunk);
            match self.send_message(chat_id, &html, Some("HTML"), reply).await {
                Ok(msg) => sent.push(msg),
                Err(e) => {
                    warn!("HTML send failed, falling back to plain text: {e}");
                    match self.send_message(chat_id, &chunk, None, reply).await {
                        Ok(msg) => sent.push(msg),
                        Err(e) => warn!("failed to send message chunk: {e}"),
                    }
                }
            }
        }
        sent
    }

    /// Edit with HTML formatting and plain-text fallback. "Message is not
    /// modified" counts as success; one retry after a rate-limit wait.
    pub async fn edit_message_safe(&self, chat_id: i64, message_id: i64, text: &str) -> bool {
        let text = truncate_for_edit(text);
        let html = markdown_to_telegram_html(&text);
        for _ in 0..2 {
            match self.edit_message_text(chat_id, message_id, &html, Some("HTML")).await {
                Ok(()) => return true,
                Err(e) if e.is_not_modified() => return true,
                Err(e) => {
                    if let Some(seconds) = e.retry_after() {
                        tokio::time::sleep(Duration::from_secs(seconds)).await;
                        continue;
                    }
                    // Likely an HTML parse rejection; retry as plain text.
                    match self.edit_message_text(chat_id, message_id, &text, None).await {
                        Ok(()) => return true,
                        Err(e) if e.is_not_modified() => return true,
                        Err(e) => {
                            if let Some(seconds) = e.retry_after() {
                                tokio::time::sleep(Duration::from_secs(seconds)).await;
                                continue;
                            }
                            warn!("failed to edit message: {e}");
                            return false;
                        }
                    }
                }
            }
        }
        false
    }
}
