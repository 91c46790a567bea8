//! Memory tool: save_memory plus prompt enrichment and the tag fallback for
//! models that cannot call tools.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::info;

use crate::services::Services;

use super::Tool;

static MEMORY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\[MEMORY:\s*(.+?)\]").unwrap(),
        Regex::new(r"\[记忆:\s*(.+?)\]").unwrap(),
        Regex::new(r"(?is)<memory>\s*(.+?)\s*</memory>").unwrap(),
    ]
});

pub struct MemoryTool {
    services: Arc<Services>,
}

impl MemoryTool {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for MemoryTool {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn definitions(&self) -> Vec<Value> {
        vec![json!({
            "type": "function",
            "function": {
                "name": "save_memory",
                "description": "Save important information about the user that should be remembered \
                    across conversations. Use this for user preferences, facts, context, \
                    or anything worth remembering long-term.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "content": {
                            "type": "string",
                            "description": "The information to remember, written as a brief factual statement"
                        }
                    },
                    "required": ["content"]
                }
            }
        })]
    }

    async fn execute(&self, user_id: i64, _tool_name: &str, arguments: &Value) -> Option<String> {
        let content = arguments["content"].as_str().unwrap_or("").trim();
        if !content.is_empty() {
            self.services.add_memory(user_id, content, "ai").await;
            info!(user_id, "saved memory via tool call");
        }
        None
    }

    fn instruction(&self) -> &'static str {
        "\n\nYou can save important information about the user using the save_memory tool. \
         Use it for preferences, facts, or context worth remembering long-term. \
         If the tool is not available, you can use [MEMORY: description] format instead."
    }

    async fn enrich_system_prompt(&self, user_id: i64, prompt: String, query: Option<&str>) -> String {
        match self.services.format_memories_for_prompt(user_id, query).await {
            Some(memories) => format!("{prompt}\n\n{memories}"),
            None => prompt,
        }
    }

    /// Extract fallback-tagged memories from the assistant text and save
    /// them, returning the text with the tags removed.
    async fn post_process(&self, user_id: i64, text: String) -> String {
        let mut cleaned = text;
        let mut found = Vec::new();
        for pattern in MEMORY_PATTERNS.iter() {
            for caps in pattern.captures_iter(&cleaned) {
                found.push(caps[1].trim().to_string());
            }
            cleaned = pattern.replace_all(&cleaned, "").into_owned();
        }
        for content in found {
            if !content.is_empty() {
                self.services.add_memory(user_id, &content, "ai").await;
                info!(user_id, "saved memory via tag fallback");
            }
        }
        cleaned.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_match_all_fallback_forms() {
        let text = "Noted. [MEMORY: likes tea] and <memory>works at night</memory> plus [记忆: 喜欢猫]";
        let mut found = Vec::new();
        for pattern in MEMORY_PATTERNS.iter() {
            for caps in pattern.captures_iter(text) {
                found.push(caps[1].trim().to_string());
            }
        }
        assert_eq!(found.len(), 3);
        assert!(found.contains(&"likes tea".to_string()));
        assert!(found.contains(&"works at night".to_string()));
        assert!(found.contains(&"喜欢猫".to_string()));
    }
}
