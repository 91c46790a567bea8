//! Chat-side command surface. Handlers are thin: parse arguments, call the
//! services facade, reply.

mod basic;
mod memory;
mod persona;
mod session;
mod settings;
mod usage;

use std::sync::Arc;

use crate::chat::ChatPipeline;
use crate::services::Services;
use crate::telegram::{Message, TelegramClient};

pub struct CommandContext {
    pub services: Arc<Services>,
    pub telegram: TelegramClient,
    pub pipeline: Arc<ChatPipeline>,
}

impl CommandContext {
    pub(crate) async fn reply(&self, message: &Message, text: &str) {
        let _ = self
            .telegram
            .send_message(message.chat.id, text, None, Some(message.message_id))
            .await;
    }

    pub(crate) fn user_id(&self, message: &Message) -> i64 {
        message.from.as_ref().map(|u| u.id).unwrap_or(message.chat.id)
    }
}

/// Route a parsed `/command`. Returns false when the command is unknown.
pub async fn dispatch(ctx: &CommandContext, message: &Message, command: &str, args: &str) -> bool {
    match command {
        "start" => basic::start(ctx, message).await,
        "help" => basic::help(ctx, message).await,
        "clear" => basic::clear(ctx, message).await,
        "retry" => ctx.pipeline.retry(message).await,
        "settings" => settings::show(ctx, message).await,
        "set" => settings::set(ctx, message, args).await,
        "persona" => persona::persona(ctx, message, args).await,
        "chat" => session::chat(ctx, message, args).await,
        "remember" => memory::remember(ctx, message, args).await,
        "memories" => memory::memories(ctx, message).await,
        "forget" => memory::forget(ctx, message, args).await,
        "usage" => usage::usage(ctx, message).await,
        "export" => usage::export(ctx, message).await,
        _ => return false,
    }
    true
}
