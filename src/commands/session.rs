//! `/chat` session management.

use crate::telegram::Message;

use super::CommandContext;

pub async fn chat(ctx: &CommandContext, message: &Message, args: &str) {
    let user_id = ctx.user_id(message);
    let persona_name = ctx.services.get_current_persona_name(user_id);
    let mut parts = args.split_whitespace();
    let Some(first) = parts.next() else {
        list_sessions(ctx, message, user_id, &persona_name).await;
        return;
    };

    match first.to_lowercase().as_str() {
        "new" => {
            let title = parts.collect::<Vec<_>>().join(" ");
            let title = if title.is_empty() { None } else { Some(title) };
            let display = title.clone().unwrap_or_else(|| "New Chat".to_string());
            ctx.services.create_session(user_id, &persona_name, title);
            let count = ctx.services.get_sessions(user_id, &persona_name).len();
            ctx.reply(
                message,
                &format!("Created new session: {display}\nSwitched to session #{count}"),
            )
            .await;
        }
        "rename" => {
            let title = parts.collect::<Vec<_>>().join(" ");
            if title.is_empty() {
                ctx.reply(message, "Usage: /chat rename <title>").await;
                return;
            }
            if ctx.services.rename_session(user_id, &persona_name, &title) {
                ctx.reply(message, &format!("Session renamed to: {title}")).await;
            } else {
                ctx.reply(message, "No current session to rename.").await;
            }
        }
        "delete" => {
            let Some(index) = parts.next().and_then(|v| v.parse::<usize>().ok()) else {
                ctx.reply(message, "Usage: /chat delete <number>").await;
                return;
            };
            match ctx.services.delete_session(user_id, &persona_name, index) {
                Some(session) => {
                    let title = session.title.unwrap_or_else(|| "New Chat".to_string());
                    ctx.reply(message, &format!("Deleted session: {title}")).await;
                }
                None => {
                    let total = ctx.services.get_sessions(user_id, &persona_name).len();
                    ctx.reply(message, &format!("Invalid session number. Valid range: 1-{total}"))
                        .await;
                }
            }
        }
        other => match other.parse::<usize>() {
            Ok(index) => match ctx.services.switch_session(user_id, &persona_name, index) {
                Some(session) => {
                    let title = session.title.unwrap_or_else(|| "New Chat".to_string());
                    let count = ctx.services.session_message_count(session.id);
                    ctx.reply(
                        message,
                        &format!("Switched to session #{index}: {title}\nMessages: {count}"),
                    )
                    .await;
                }
                None => {
                    let total = ctx.services.get_sessions(user_id, &persona_name).len();
                    ctx.reply(message, &format!("Invalid session number. Valid range: 1-{total}"))
                        .await;
                }
            },
            Err(_) => {
                ctx.reply(
                    message,
                    "Unknown subcommand. Usage:\n\n\
                     /chat - list sessions\n\
                     /chat new [title] - new session\n\
                     /chat <num> - switch session\n\
                     /chat rename <title> - rename\n\
                     /chat delete <num> - delete",
                )
                .await;
            }
        },
    }
}

async fn list_sessions(ctx: &CommandContext, message: &Message, user_id: i64, persona_name: &str) {
    let sessions = ctx.services.get_sessions(user_id, persona_name);
    if sessions.is_empty() {
        ctx.reply(
            message,
            &format!(
                "No sessions for persona '{persona_name}'.\n\
                 Send a message to create one automatically, or use /chat new"
            ),
        )
        .await;
        return;
    }

    let current = ctx.services.get_current_session_id(user_id, persona_name);
    let mut lines = vec![format!("Sessions (persona: {persona_name})\n")];
    for (i, session) in sessions.iter().enumerate() {
        let marker = if current == Some(session.id) { "> " } else { "  " };
        let title = session.title.clone().unwrap_or_else(|| "New Chat".to_string());
        let count = ctx.services.session_message_count(session.id);
        lines.push(format!("{marker}{}. {title} ({count} msgs)", i + 1));
    }
    lines.push(String::new());
    lines.push("/chat <num> - switch".to_string());
    lines.push("/chat new - new session".to_string());
    lines.push("/chat rename <title> - rename".to_string());
    lines.push("/chat delete <num> - delete".to_string());

    ctx.reply(message, &lines.join("\n")).await;
}
