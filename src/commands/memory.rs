//! `/remember`, `/memories`, `/forget`.

use tracing::info;

use crate::telegram::Message;

use super::CommandContext;

pub async fn remember(ctx: &CommandContext, message: &Message, args: &str) {
    let user_id = ctx.user_id(message);
    let content = args.trim();
    if content.is_empty() {
        ctx.reply(
            message,
            "Usage: /remember <content>\n\nExample: /remember I prefer concise answers",
        )
        .await;
        return;
    }
    ctx.services.add_memory(user_id, content, "user").await;
    info!(user_id, "memory added via /remember");
    ctx.reply(message, &format!("Remembered: {content}")).await;
}

pub async fn memories(ctx: &CommandContext, message: &Message) {
    let user_id = ctx.user_id(message);
    let memories = ctx.services.get_memories(user_id);
    if memories.is_empty() {
        ctx.reply(
            message,
            "No memories yet.\n\n\
             Use /remember <content> to add a memory.\n\
             AI can also add memories during conversations.",
        )
        .await;
        return;
    }

    let mut lines = vec!["Your memories:\n".to_string()];
    for (i, memory) in memories.iter().enumerate() {
        let source_tag = if memory.source == "ai" { "[AI]" } else { "[user]" };
        lines.push(format!("{}. {source_tag} {}", i + 1, memory.content));
    }
    lines.push("\n[user] = added by you".to_string());
    lines.push("[AI] = added by AI".to_string());
    lines.push("\nUse /forget <number> to delete".to_string());
    lines.push("Use /forget all to clear all".to_string());

    ctx.reply(message, &lines.join("\n")).await;
}

pub async fn forget(ctx: &CommandContext, message: &Message, args: &str) {
    let user_id = ctx.user_id(message);
    let arg = args.trim().to_lowercase();
    if arg.is_empty() {
        ctx.reply(
            message,
            "Usage:\n\
             /forget <number> - Delete specific memory\n\
             /forget all - Clear all memories\n\n\
             Use /memories to see the list with numbers.",
        )
        .await;
        return;
    }

    if arg == "all" {
        let count = ctx.services.clear_memories(user_id);
        info!(user_id, count, "memories cleared");
        if count > 0 {
            ctx.reply(message, &format!("Cleared {count} memories.")).await;
        } else {
            ctx.reply(message, "No memories to clear.").await;
        }
        return;
    }

    match arg.parse::<usize>() {
        Ok(index) => {
            if ctx.services.delete_memory(user_id, index) {
                info!(user_id, index, "memory deleted");
                ctx.reply(message, &format!("Memory #{index} deleted.")).await;
            } else {
                ctx.reply(
                    message,
                    &format!("Invalid memory number: {index}\nUse /memories to see the list."),
                )
                .await;
            }
        }
        Err(_) => {
            ctx.reply(message, "Please specify a number or 'all'.\nExample: /forget 1 or /forget all")
                .await;
        }
    }
}
