//! `/usage` and `/export`.

use crate::telegram::Message;

use super::CommandContext;

pub async fn usage(ctx: &CommandContext, message: &Message) {
    let user_id = ctx.user_id(message);
    let persona_name = ctx.services.get_current_persona_name(user_id);
    let usage = ctx.services.get_token_usage(user_id, &persona_name);
    let total_all = ctx.services.get_total_tokens(user_id);
    let settings = ctx.services.get_user_settings(user_id);

    let mut text = format!(
        "Token Usage (Persona: {persona_name}):\n\n\
         Prompt tokens:     {}\n\
         Completion tokens: {}\n\
         Total tokens:      {}\n\n\
         --- All Personas ---\n\
         Total tokens: {total_all}\n",
        usage.prompt_tokens, usage.completion_tokens, usage.total_tokens,
    );

    if settings.token_limit > 0 {
        let remaining = ctx.services.get_remaining_tokens(user_id).unwrap_or(0);
        let percentage = ctx.services.get_usage_percentage(user_id).unwrap_or(0.0);
        text.push_str(&format!(
            "\nGlobal Limit: {}\nRemaining:    {remaining}\nUsage:        {percentage:.1}%\n\n",
            settings.token_limit
        ));
        let filled = (percentage / 5.0) as usize;
        let bar: String = "#".repeat(filled.min(20)) + &"-".repeat(20 - filled.min(20));
        text.push_str(&format!("[{bar}] {percentage:.1}%"));
    }

    ctx.reply(message, &text).await;
}

pub async fn export(ctx: &CommandContext, message: &Message) {
    let user_id = ctx.user_id(message);
    let persona_name = ctx.services.get_current_persona_name(user_id);
    match ctx.services.export_session_markdown(user_id) {
        Some((filename, content)) => {
            let caption = format!("Chat history export (Persona: {persona_name})");
            if let Err(e) = ctx
                .telegram
                .send_document(message.chat.id, content.into_bytes(), &filename, Some(&caption))
                .await
            {
                tracing::error!(user_id, "export failed: {e}");
                ctx.reply(message, "Error. Please retry.").await;
            }
        }
        None => {
            ctx.reply(
                message,
                &format!("No conversation history to export for persona '{persona_name}'."),
            )
            .await;
        }
    }
}
