//! Update routing: long polling, the group-chat gate, command parsing,
//! media-group aggregation and document handling. Each update is handled in
//! its own task so users never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::chat::{ChatPipeline, TurnInput};
use crate::commands::{dispatch, CommandContext};
use crate::config::{MAX_FILE_SIZE, MAX_TEXT_CONTENT_LENGTH};
use crate::services::Services;
use crate::telegram::{Message, TelegramClient};

const POLL_TIMEOUT_SECS: u64 = 50;
const MEDIA_GROUP_SETTLE: Duration = Duration::from_millis(1500);

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "py", "js", "ts", "jsx", "tsx", "java", "c", "cpp", "h", "hpp", "cs", "go",
    "rs", "rb", "php", "swift", "kt", "scala", "html", "css", "scss", "sass", "less", "xml",
    "json", "yaml", "yml", "toml", "ini", "cfg", "conf", "sh", "bash", "zsh", "fish", "ps1",
    "bat", "cmd", "sql", "r", "m", "pl", "lua", "vim", "el", "clj", "hs", "ml", "ex", "exs",
    "erl", "fs", "v", "sv", "vhd", "asm", "s", "makefile", "cmake", "dockerfile", "gitignore",
    "env", "log", "csv", "tsv", "rst", "tex", "bib", "org", "adoc", "diff", "patch",
];

pub struct Bot {
    telegram: TelegramClient,
    pipeline: Arc<ChatPipeline>,
    commands: CommandContext,
    bot_id: i64,
    bot_username: String,
    media_groups: Mutex<HashMap<String, Vec<Message>>>,
}

impl Bot {
    pub async fn new(
        telegram: TelegramClient,
        pipeline: Arc<ChatPipeline>,
        services: Arc<Services>,
    ) -> Result<Arc<Self>> {
        let me = telegram.get_me().await.context("getMe failed; check TELEGRAM_BOT_TOKEN")?;
        info!("bot connected as @{}", me.username.as_deref().unwrap_or(&me.first_name));
        Ok(Arc::new(Self {
            commands: CommandContext {
                services,
                telegram: telegram.clone(),
                pipeline: pipeline.clone(),
            },
            telegram,
            pipeline,
            bot_id: me.id,
            bot_username: me.username.unwrap_or_default(),
            media_groups: Mutex::new(HashMap::new()),
        }))
    }

    /// Long-poll loop. Runs until the task is aborted at shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut offset = 0i64;
        loop {
            match self.telegram.get_updates(offset, POLL_TIMEOUT_SECS).await {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Some(message) = update.message {
                            let bot = self.clone();
                            tokio::spawn(async move { bot.handle_message(message).await });
                        }
                    }
                }
                Err(e) => {
                    warn!("getUpdates failed: {e}");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
    }

    async fn handle_message(self: Arc<Self>, message: Message) {
        if message.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
            return;
        }

        if let Some(text) = message.text.clone() {
            if let Some(rest) = text.strip_prefix('/') {
                self.handle_command(&message, rest).await;
                return;
            }
        }

        if !self.should_respond(&message) {
            return;
        }

        if message.photo.is_some() {
            if message.media_group_id.is_some() {
                self.buffer_media_group(message);
            } else {
                self.handle_photos(vec![message]).await;
            }
            return;
        }

        if message.document.is_some() {
            self.handle_document(message).await;
            return;
        }

        // Forwarded messages are skipped; replying to them triggers a turn.
        if message.forward_origin.is_some() {
            return;
        }

        let Some(text) = message.text.clone() else { return };
        let mut text = self.strip_mention(&text);
        if text.is_empty() {
            return;
        }

        if let Some(reply) = &message.reply_to_message {
            let quoted = reply.text_or_caption();
            if !quoted.is_empty() {
                let sender = reply
                    .from
                    .as_ref()
                    .map(|u| u.first_name.clone())
                    .unwrap_or_else(|| "Unknown".to_string());
                text = format!("[Quoted message from {sender}]:\n{quoted}\n\n{text}");
            }
        }

        let input = self.pipeline.text_turn(&message, text);
        self.pipeline.run_turn(input).await;
    }

    async fn handle_command(&self, message: &Message, rest: &str) {
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        let (command, target) = match head.split_once('@') {
            Some((command, target)) => (command, Some(target)),
            None => (head, None),
        };
        // In groups a command may be addressed to a specific bot.
        if let Some(target) = target {
            if !target.eq_ignore_ascii_case(&self.bot_username) {
                return;
            }
        }
        if !dispatch(&self.commands, message, &command.to_lowercase(), args).await
            && message.chat.is_private()
        {
            self.commands.reply(message, "Unknown command. Type /help for the list.").await;
        }
    }

    /// Group-chat gate: respond only in private chats, to replies to the
    /// bot, or when mentioned in text, caption or entities.
    fn should_respond(&self, message: &Message) -> bool {
        if message.chat.is_private() {
            return true;
        }
        if let Some(reply) = &message.reply_to_message {
            if reply.from.as_ref().map(|u| u.id) == Some(self.bot_id) {
                return true;
            }
        }
        let handle = format!("@{}", self.bot_username);
        if message.text_or_caption().contains(&handle) {
            return true;
        }
        let entities = message
            .entities
            .iter()
            .chain(message.caption_entities.iter())
            .flatten();
        for entity in entities {
            if entity.kind == "mention" {
                let text: Vec<char> = message.text_or_caption().chars().collect();
                if entity.offset + entity.length <= text.len() {
                    let mention: String =
                        text[entity.offset..entity.offset + entity.length].iter().collect();
                    if mention == handle {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn strip_mention(&self, text: &str) -> String {
        if self.bot_username.is_empty() {
            return text.trim().to_string();
        }
        text.replace(&format!("@{}", self.bot_username), "").trim().to_string()
    }

    /// Album parts arrive as separate updates sharing a media_group_id.
    /// Parts are buffered and flushed as one logical turn once the group has
    /// settled.
    fn buffer_media_group(self: Arc<Self>, message: Message) {
        let Some(group_id) = message.media_group_id.clone() else { return };
        let key = format!("{}:{group_id}", message.chat.id);
        let is_first = {
            let mut groups = self.media_groups.lock().expect("media group lock poisoned");
            let entry = groups.entry(key.clone()).or_default();
            entry.push(message);
            entry.len() == 1
        };
        if is_first {
            let bot = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(MEDIA_GROUP_SETTLE).await;
                let mut messages = bot
                    .media_groups
                    .lock()
                    .expect("media group lock poisoned")
                    .remove(&key)
                    .unwrap_or_default();
                messages.sort_by_key(|m| m.message_id);
                bot.handle_photos(messages).await;
            });
        }
    }

    async fn handle_photos(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let caption = messages
            .iter()
            .filter_map(|m| m.caption.as_deref())
            .find(|c| !c.is_empty())
            .map(|c| self.strip_mention(c))
            .unwrap_or_default();

        match self.pipeline.photo_turn(&messages, caption).await {
            Ok(input) => self.pipeline.run_turn(input).await,
            Err(e) => {
                error!("failed to build photo turn: {e:#}");
                if let Some(first) = messages.first() {
                    let _ = self
                        .telegram
                        .send_message(first.chat.id, "Error. Please retry.", None, Some(first.message_id))
                        .await;
                }
            }
        }
    }

    async fn handle_document(&self, message: Message) {
        let Some(document) = message.document.clone() else { return };
        let name = document.file_name.clone().unwrap_or_else(|| "file".to_string());

        if document.file_size.unwrap_or(0) as u64 > MAX_FILE_SIZE {
            self.commands
                .reply(&message, &format!("File too large (max {}MB).", MAX_FILE_SIZE / 1024 / 1024))
                .await;
            return;
        }

        let extension = name.rsplit('.').next().unwrap_or("").to_lowercase();
        let caption = self.strip_mention(message.caption.as_deref().unwrap_or(""));
        let user_id = message.from.as_ref().map(|u| u.id).unwrap_or(message.chat.id);

        if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            match self.pipeline.photo_document_turn(&message, &document, &extension, caption).await {
                Ok(input) => self.pipeline.run_turn(input).await,
                Err(e) => error!(user_id, "failed to build image document turn: {e:#}"),
            }
            return;
        }

        let is_texty = TEXT_EXTENSIONS.contains(&extension.as_str())
            || document.mime_type.as_deref().map(|m| m.starts_with("text/")).unwrap_or(false);
        if !is_texty {
            self.commands
                .reply(&message, &format!("Unsupported file type: .{extension}"))
                .await;
            return;
        }

        let data = match self.download_document(&document.file_id).await {
            Ok(data) => data,
            Err(e) => {
                error!(user_id, "document download failed: {e:#}");
                self.commands.reply(&message, "Error. Please retry.").await;
                return;
            }
        };
        let mut content = String::from_utf8_lossy(&data).into_owned();
        if content.chars().count() > MAX_TEXT_CONTENT_LENGTH {
            content = content.chars().take(MAX_TEXT_CONTENT_LENGTH).collect();
            content.push_str("\n...(truncated)");
        }

        let prompt = if caption.is_empty() {
            format!("[File: {name}]\n\n{content}")
        } else {
            format!("{caption}\n\n[File: {name}]\n\n{content}")
        };
        let mut save_msg = format!("[File: {name}]");
        if !caption.is_empty() {
            save_msg.push(' ');
            save_msg.push_str(&caption);
        }
        let preview: String = content.chars().take(500).collect();
        save_msg.push('\n');
        save_msg.push_str(&preview);

        let input = TurnInput {
            user_id,
            chat_id: message.chat.id,
            reply_to: message.message_id,
            user_content: Value::String(prompt),
            save_msg,
            query_text: if caption.is_empty() { name } else { caption },
        };
        self.pipeline.run_turn(input).await;
    }

    async fn download_document(&self, file_id: &str) -> Result<Vec<u8>> {
        let info = self.telegram.get_file(file_id).await.context("getFile failed")?;
        let path = info.file_path.context("file has no path")?;
        Ok(self.telegram.download_file(&path).await.context("download failed")?)
    }
}
