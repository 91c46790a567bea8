//! `/start`, `/help`, `/clear`.

use crate::telegram::Message;

use super::CommandContext;

pub async fn start(ctx: &CommandContext, message: &Message) {
    let user_id = ctx.user_id(message);
    if !ctx.services.has_api_key(user_id) {
        ctx.reply(
            message,
            "Welcome to Gemen! 👋\n\n\
             To get started, set your API key:\n\
             /set api_key YOUR_API_KEY\n\n\
             Optionally configure:\n\
             /set base_url <url> - Custom API endpoint\n\
             /set model <name> - Choose a model\n\n\
             Type /help for all commands.",
        )
        .await;
    } else {
        let persona = ctx.services.get_current_persona_name(user_id);
        ctx.reply(
            message,
            &format!(
                "Welcome back! Current persona: {persona}\n\n\
                 Send a message to start chatting, or /help for commands."
            ),
        )
        .await;
    }
}

pub async fn help(ctx: &CommandContext, message: &Message) {
    ctx.reply(
        message,
        "Gemen Help\n\n\
         Send text, image, or file to chat with AI.\n\
         In groups: reply to bot or @mention.\n\n\
         Chat:\n\
         /clear - Clear conversation\n\
         /retry - Retry last message\n\
         /export - Export session as Markdown\n\n\
         Personas & sessions:\n\
         /persona - Manage personas\n\
         /chat - Manage chat sessions\n\n\
         Memory:\n\
         /remember <text> - Save a memory\n\
         /memories - List memories\n\
         /forget <num|all> - Delete memories\n\n\
         Configuration:\n\
         /settings - Show settings\n\
         /set <key> <value> - Change settings\n\
         /usage - Token usage",
    )
    .await;
}

pub async fn clear(ctx: &CommandContext, message: &Message) {
    let user_id = ctx.user_id(message);
    let persona_name = ctx.services.clear_current_conversation(user_id);
    ctx.services.reset_token_usage(user_id, &persona_name);
    ctx.reply(
        message,
        &format!("Conversation cleared and usage reset for persona '{persona_name}'."),
    )
    .await;
}
