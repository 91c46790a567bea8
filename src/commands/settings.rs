//! `/settings` and `/set`.

use crate::ai::ChatClient;
use crate::telegram::Message;

use super::CommandContext;

const SET_USAGE: &str = "Usage: /set <key> <value>\n\n\
    Available keys:\n\
    - base_url\n\
    - api_key\n\
    - model (no value to browse list)\n\
    - temperature\n\
    - token_limit\n\
    - voice / style / endpoint (TTS)\n\
    - title_model\n\
    - tool <name> <on|off>\n\
    - provider list | save <name> | load <name> | delete <name>\n\n\
    For prompt, use /persona prompt <text>";

fn mask_key(key: &str) -> String {
    if key.chars().count() > 12 {
        let start: String = key.chars().take(8).collect();
        let end: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("{start}...{end}")
    } else {
        "***".to_string()
    }
}

pub async fn show(ctx: &CommandContext, message: &Message) {
    let user_id = ctx.user_id(message);
    let settings = ctx.services.get_user_settings(user_id);
    let persona = ctx.services.get_current_persona(user_id);

    let mut prompt = persona.system_prompt.clone();
    if prompt.chars().count() > 80 {
        prompt = format!("{}...", prompt.chars().take(80).collect::<String>());
    }

    ctx.reply(
        message,
        &format!(
            "Current Settings:\n\n\
             base_url: {}\n\
             api_key: {}\n\
             model: {}\n\
             temperature: {}\n\
             token_limit: {}\n\
             enabled_tools: {}\n\
             voice: {}\n\
             style: {}\n\
             title_model: {}\n\
             persona: {}\n\
             prompt: {prompt}\n\n\
             Use /persona to manage personas and prompts.",
            settings.base_url,
            mask_key(&settings.api_key),
            settings.model,
            settings.temperature,
            settings.token_limit,
            settings.enabled_tools,
            settings.tts_voice,
            settings.tts_style,
            if settings.title_model.is_empty() { "(chat model)" } else { &settings.title_model },
            persona.name,
        ),
    )
    .await;
}

pub async fn set(ctx: &CommandContext, message: &Message, args: &str) {
    let user_id = ctx.user_id(message);
    let mut parts = args.split_whitespace();
    let Some(head) = parts.next() else {
        ctx.reply(message, SET_USAGE).await;
        return;
    };
    let key = head.to_lowercase();
    let value = args[head.len()..].trim();

    match key.as_str() {
        "base_url" if !value.is_empty() => {
            ctx.services.set_base_url(user_id, value);
            ctx.reply(message, &format!("base_url set to: {value}")).await;
        }
        "api_key" if !value.is_empty() => set_api_key(ctx, message, user_id, value).await,
        "model" => set_model(ctx, message, user_id, value).await,
        "temperature" if !value.is_empty() => match value.parse::<f64>() {
            Ok(temperature) => match ctx.services.set_temperature(user_id, temperature) {
                Ok(()) => ctx.reply(message, &format!("temperature set to: {temperature}")).await,
                Err(e) => ctx.reply(message, &e.user_text()).await,
            },
            Err(_) => ctx.reply(message, "Invalid temperature value").await,
        },
        "token_limit" if !value.is_empty() => match value.parse::<i64>() {
            Ok(limit) => match ctx.services.set_token_limit(user_id, limit) {
                Ok(()) => ctx.reply(message, &format!("token_limit set to: {limit}")).await,
                Err(e) => ctx.reply(message, &e.user_text()).await,
            },
            Err(_) => ctx.reply(message, "Invalid token limit value").await,
        },
        "voice" if !value.is_empty() => {
            ctx.services.set_tts_voice(user_id, value);
            ctx.reply(message, &format!("voice set to: {value}")).await;
        }
        "style" if !value.is_empty() => {
            ctx.services.set_tts_style(user_id, value);
            ctx.reply(message, &format!("style set to: {value}")).await;
        }
        "endpoint" if !value.is_empty() => {
            ctx.services.set_tts_endpoint(user_id, value);
            ctx.reply(message, &format!("endpoint set to: {value}")).await;
        }
        "title_model" if !value.is_empty() => {
            ctx.services.set_title_model(user_id, value);
            ctx.reply(message, &format!("title_model set to: {value}")).await;
        }
        "tool" => set_tool(ctx, message, user_id, value).await,
        "provider" => set_provider(ctx, message, user_id, value).await,
        "prompt" => {
            ctx.reply(
                message,
                "Prompts are per-persona.\nUse /persona prompt <text> to set the prompt for the current persona.",
            )
            .await;
        }
        _ => ctx.reply(message, SET_USAGE).await,
    }
}

/// Setting a key validates it against `list_models`; a key that fails
/// validation is rejected and the previous key restored.
async fn set_api_key(ctx: &CommandContext, message: &Message, user_id: i64, value: &str) {
    let previous = ctx.services.get_user_settings(user_id).api_key;
    ctx.services.set_api_key(user_id, value);

    let settings = ctx.services.get_user_settings(user_id);
    let client = ChatClient::new(&settings.api_key, &settings.base_url);
    match client.list_models().await {
        Ok(models) if !models.is_empty() => {
            ctx.reply(
                message,
                &format!(
                    "api_key set to: {}\n✅ Verified ({} models available)",
                    mask_key(value),
                    models.len()
                ),
            )
            .await;
        }
        _ => {
            ctx.services.set_api_key(user_id, &previous);
            ctx.reply(
                message,
                "❌ Could not verify the key against the API; it was not saved. \
                 Check your base_url and api_key.",
            )
            .await;
        }
    }
}

async fn set_model(ctx: &CommandContext, message: &Message, user_id: i64, value: &str) {
    if value.is_empty() {
        show_model_list(ctx, message, user_id).await;
        return;
    }
    // A numeric value selects from the listed models.
    if let Ok(index) = value.parse::<usize>() {
        let settings = ctx.services.get_user_settings(user_id);
        let client = ChatClient::new(&settings.api_key, &settings.base_url);
        match client.list_models().await {
            Ok(models) if index >= 1 && index <= models.len() => {
                let model = models[index - 1].clone();
                ctx.services.set_model(user_id, &model);
                ctx.reply(message, &format!("model set to: {model}")).await;
            }
            Ok(models) => {
                ctx.reply(message, &format!("Invalid model number. Valid range: 1-{}", models.len()))
                    .await;
            }
            Err(_) => {
                ctx.reply(message, "Failed to fetch models. Check your API key and base_url.").await;
            }
        }
        return;
    }
    ctx.services.set_model(user_id, value);
    ctx.reply(message, &format!("model set to: {value}")).await;
}

async fn show_model_list(ctx: &CommandContext, message: &Message, user_id: i64) {
    let settings = ctx.services.get_user_settings(user_id);
    if settings.api_key.is_empty() {
        ctx.reply(message, "Please set your API key first:\n/set api_key YOUR_API_KEY").await;
        return;
    }
    let client = ChatClient::new(&settings.api_key, &settings.base_url);
    match client.list_models().await {
        Ok(models) if !models.is_empty() => {
            let mut lines = vec![format!("Available models (current: {}):\n", settings.model)];
            for (i, model) in models.iter().take(30).enumerate() {
                let marker = if *model == settings.model { "* " } else { "  " };
                lines.push(format!("{marker}{}. {model}", i + 1));
            }
            if models.len() > 30 {
                lines.push(format!("... and {} more", models.len() - 30));
            }
            lines.push("\nUse /set model <number> or /set model <name>".to_string());
            ctx.reply(message, &lines.join("\n")).await;
        }
        _ => {
            ctx.reply(message, "Failed to fetch models. Check your API key and base_url.").await;
        }
    }
}

async fn set_tool(ctx: &CommandContext, message: &Message, user_id: i64, value: &str) {
    let mut parts = value.split_whitespace();
    let (Some(tool), Some(state)) = (parts.next(), parts.next()) else {
        ctx.reply(message, "Usage: /set tool <name> <on|off>").await;
        return;
    };
    let enabled = match state.to_lowercase().as_str() {
        "on" => true,
        "off" => false,
        _ => {
            ctx.reply(message, "Usage: /set tool <name> <on|off>").await;
            return;
        }
    };
    match ctx.services.set_tool_enabled(user_id, tool, enabled) {
        Ok(tools) => {
            ctx.reply(
                message,
                &format!(
                    "Tool '{tool}' turned {}.\nEnabled tools: {}",
                    if enabled { "on" } else { "off" },
                    if tools.is_empty() { "(none)" } else { &tools }
                ),
            )
            .await;
        }
        Err(e) => ctx.reply(message, &e.user_text()).await,
    }
}

async fn set_provider(ctx: &CommandContext, message: &Message, user_id: i64, value: &str) {
    let mut parts = value.split_whitespace();
    let verb = parts.next().unwrap_or("").to_lowercase();
    let name = parts.next().unwrap_or("");

    match verb.as_str() {
        "list" => {
            let providers = ctx.services.list_providers(user_id);
            if providers.is_empty() {
                ctx.reply(message, "No saved providers.\nUse /set provider save <name> to save the current one.")
                    .await;
                return;
            }
            let mut lines = vec!["Saved providers:\n".to_string()];
            for (name, preset) in providers {
                lines.push(format!("- {name}: {} ({})", preset.model, preset.base_url));
            }
            lines.push("\n/set provider load <name> - switch".to_string());
            ctx.reply(message, &lines.join("\n")).await;
        }
        "save" if !name.is_empty() => match ctx.services.save_provider(user_id, name) {
            Ok(()) => ctx.reply(message, &format!("Saved current provider as '{name}'.")).await,
            Err(e) => ctx.reply(message, &e.user_text()).await,
        },
        "load" if !name.is_empty() => match ctx.services.load_provider(user_id, name) {
            Ok(preset) => {
                ctx.reply(
                    message,
                    &format!("Loaded provider '{name}': model {} at {}", preset.model, preset.base_url),
                )
                .await;
            }
            Err(e) => ctx.reply(message, &e.user_text()).await,
        },
        "delete" if !name.is_empty() => match ctx.services.delete_provider(user_id, name) {
            Ok(()) => ctx.reply(message, &format!("Deleted provider '{name}'.")).await,
            Err(e) => ctx.reply(message, &e.user_text()).await,
        },
        // Bare "/set provider <name>" is not a load alias; loading must be
        // explicit.
        _ => {
            ctx.reply(message, "Usage: /set provider list | save <name> | load <name> | delete <name>")
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mask_key;

    #[test]
    fn long_keys_show_edges_only() {
        assert_eq!(mask_key("sk-abcdefghijklmnop"), "sk-abcde...mnop");
    }

    #[test]
    fn short_keys_are_fully_masked() {
        assert_eq!(mask_key("short"), "***");
    }
}
