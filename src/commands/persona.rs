//! `/persona` subcommands.

use crate::telegram::Message;

use super::CommandContext;

pub async fn persona(ctx: &CommandContext, message: &Message, args: &str) {
    let user_id = ctx.user_id(message);
    let mut parts = args.split_whitespace();
    let Some(first) = parts.next() else {
        list_personas(ctx, message, user_id).await;
        return;
    };

    match first.to_lowercase().as_str() {
        "new" => {
            let Some(name) = parts.next() else {
                ctx.reply(
                    message,
                    "Usage: /persona new <name> [system prompt]\n\n\
                     Example:\n/persona new coder You are a coding assistant.",
                )
                .await;
                return;
            };
            let prompt = parts.collect::<Vec<_>>().join(" ");
            let prompt = if prompt.is_empty() { None } else { Some(prompt.as_str()) };
            if ctx.services.create_persona(user_id, name, prompt) {
                ctx.services.switch_persona(user_id, name);
                ctx.reply(
                    message,
                    &format!(
                        "Created and switched to persona: {name}\n\n\
                         Use /persona prompt <text> to set its system prompt."
                    ),
                )
                .await;
            } else {
                ctx.reply(message, &format!("Persona '{name}' already exists.")).await;
            }
        }
        "delete" => {
            let Some(name) = parts.next() else {
                ctx.reply(message, "Usage: /persona delete <name>").await;
                return;
            };
            match ctx.services.delete_persona(user_id, name) {
                Ok(()) => ctx.reply(message, &format!("Deleted persona: {name}")).await,
                Err(e) => ctx.reply(message, &e.user_text()).await,
            }
        }
        "prompt" => {
            let prompt = parts.collect::<Vec<_>>().join(" ");
            if prompt.is_empty() {
                let persona = ctx.services.get_current_persona(user_id);
                ctx.reply(
                    message,
                    &format!(
                        "Current persona: {}\n\nPrompt: {}\n\nUsage: /persona prompt <new prompt>",
                        persona.name, persona.system_prompt
                    ),
                )
                .await;
                return;
            }
            ctx.services.update_current_prompt(user_id, &prompt);
            let name = ctx.services.get_current_persona_name(user_id);
            ctx.reply(message, &format!("Updated prompt for '{name}'.")).await;
        }
        _ => switch(ctx, message, user_id, first).await,
    }
}

/// Switching via `/persona <name>` requires the persona to exist;
/// `/persona new` is the only creation path from this command.
async fn switch(ctx: &CommandContext, message: &Message, user_id: i64, name: &str) {
    if !ctx.services.persona_exists(user_id, name) {
        ctx.reply(
            message,
            &format!("Persona '{name}' not found. Use /persona new {name} to create it."),
        )
        .await;
        return;
    }
    ctx.services.switch_persona(user_id, name);
    let persona = ctx.services.get_current_persona(user_id);
    let usage = ctx.services.get_token_usage(user_id, name);
    let session_id = ctx.services.ensure_session(user_id, name);
    let message_count = ctx.services.session_message_count(session_id);
    let session_count = ctx.services.get_sessions(user_id, name).len();
    let session_title = ctx
        .services
        .get_current_session(user_id, name)
        .and_then(|s| s.title)
        .unwrap_or_else(|| "New Chat".to_string());

    let mut prompt = persona.system_prompt.clone();
    if prompt.chars().count() > 100 {
        prompt = format!("{}...", prompt.chars().take(100).collect::<String>());
    }

    ctx.reply(
        message,
        &format!(
            "Switched to: {name}\n\n\
             Messages: {message_count}\n\
             Sessions: {session_count}\n\
             Current session: {session_title}\n\
             Tokens: {}\n\n\
             Prompt: {prompt}",
            usage.total_tokens
        ),
    )
    .await;
}

async fn list_personas(ctx: &CommandContext, message: &Message, user_id: i64) {
    let personas = ctx.services.get_personas(user_id);
    let current = ctx.services.get_current_persona_name(user_id);

    let mut lines = vec!["Your personas:\n".to_string()];
    for persona in &personas {
        let marker = if persona.name == current { "> " } else { "  " };
        let usage = ctx.services.get_token_usage(user_id, &persona.name);
        let session_count = ctx.services.get_sessions(user_id, &persona.name).len();
        let mut preview = persona.system_prompt.clone();
        if preview.chars().count() > 30 {
            preview = format!("{}...", preview.chars().take(30).collect::<String>());
        }
        lines.push(format!("{marker}{}", persona.name));
        lines.push(format!("    {session_count} sessions | {} tokens", usage.total_tokens));
        lines.push(format!("    {preview}"));
        lines.push(String::new());
    }
    lines.push("Commands:".to_string());
    lines.push("/persona <name> - switch".to_string());
    lines.push("/persona new <name> - create".to_string());
    lines.push("/persona delete <name> - delete".to_string());
    lines.push("/persona prompt <text> - set prompt".to_string());

    ctx.reply(message, &lines.join("\n")).await;
}
