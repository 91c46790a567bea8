//! Pluggable tool layer.
//!
//! A [`Tool`] contributes function schemas, executes calls, and may hook the
//! system prompt before the first model call and the final text afterwards.
//! The registry composes all registered tools in a stable order; the user's
//! `enabled_tools` setting filters every hook per turn.

mod error;
mod fetch;
mod memory;
mod search;
mod tts;
mod wikipedia;

pub use error::ToolError;
pub use fetch::FetchTool;
pub use memory::MemoryTool;
pub use search::SearchTool;
pub use tts::{TtsTool, VoiceJob};
pub use wikipedia::WikipediaTool;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::ai::ToolCall;
use crate::config::TOOL_TIMEOUT;

#[async_trait]
pub trait Tool: Send + Sync {
    /// Name used in the `enabled_tools` setting.
    fn name(&self) -> &'static str;

    /// Function schemas in the LLM's tool format.
    fn definitions(&self) -> Vec<Value>;

    /// Execute one call. `None` means fire-and-forget; the model sees "OK".
    async fn execute(&self, user_id: i64, tool_name: &str, arguments: &Value) -> Option<String>;

    /// Usage hint appended to the system prompt.
    fn instruction(&self) -> &'static str {
        ""
    }

    async fn enrich_system_prompt(&self, _user_id: i64, prompt: String, _query: Option<&str>) -> String {
        prompt
    }

    async fn post_process(&self, _user_id: i64, text: String) -> String {
        text
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    fn enabled(&self, enabled_tools: &str) -> Vec<&Arc<dyn Tool>> {
        let names: Vec<&str> = enabled_tools.split(',').map(str::trim).collect();
        self.tools.iter().filter(|t| names.contains(&t.name())).collect()
    }

    pub fn get_definitions(&self, enabled_tools: &str) -> Vec<Value> {
        self.enabled(enabled_tools)
            .into_iter()
            .flat_map(|t| t.definitions())
            .collect()
    }

    pub fn get_instructions(&self, enabled_tools: &str) -> String {
        self.enabled(enabled_tools)
            .into_iter()
            .map(|t| t.instruction())
            .collect()
    }

    pub async fn enrich_system_prompt(
        &self,
        user_id: i64,
        mut prompt: String,
        enabled_tools: &str,
        query: Option<&str>,
    ) -> String {
        for tool in self.enabled(enabled_tools) {
            prompt = tool.enrich_system_prompt(user_id, prompt, query).await;
        }
        prompt
    }

    pub async fn post_process(&self, user_id: i64, mut text: String, enabled_tools: &str) -> String {
        for tool in self.enabled(enabled_tools) {
            text = tool.post_process(user_id, text).await;
        }
        text
    }

    /// Dispatch tool calls and build the tool-result messages.
    ///
    /// Each execution gets its own deadline; on expiry a synthetic timeout
    /// result stands in so the loop keeps going. Unknown names and malformed
    /// arguments become error results rather than failures. An empty return
    /// means every call was fire-and-forget.
    pub async fn process_tool_calls(
        &self,
        user_id: i64,
        tool_calls: &[ToolCall],
        enabled_tools: &str,
    ) -> Vec<Value> {
        let enabled = self.enabled(enabled_tools);
        let mut results = Vec::new();
        let mut has_results = false;

        for call in tool_calls {
            let tool = enabled.iter().find(|t| {
                t.definitions()
                    .iter()
                    .any(|d| d["function"]["name"].as_str() == Some(call.name.as_str()))
            });

            let content = match tool {
                None => {
                    warn!(user_id, name = %call.name, "no tool registered for call");
                    has_results = true;
                    Some(format!("Unknown tool: {}", call.name))
                }
                Some(tool) => match serde_json::from_str::<Value>(&call.arguments) {
                    Err(e) => {
                        warn!(user_id, name = %call.name, "bad tool arguments: {e}");
                        has_results = true;
                        Some(format!("Invalid arguments for {}: {e}", call.name))
                    }
                    Ok(arguments) => {
                        match tokio::time::timeout(
                            TOOL_TIMEOUT,
                            tool.execute(user_id, &call.name, &arguments),
                        )
                        .await
                        {
                            Ok(result) => {
                                if result.is_some() {
                                    has_results = true;
                                }
                                result
                            }
                            Err(_) => {
                                warn!(user_id, name = %call.name, "tool execution timed out");
                                has_results = true;
                                Some(format!(
                                    "Tool {} timed out after {} seconds.",
                                    call.name,
                                    TOOL_TIMEOUT.as_secs()
                                ))
                            }
                        }
                    }
                },
            };

            results.push(json!({
                "role": "tool",
                "tool_call_id": call.id,
                "content": content.unwrap_or_else(|| "OK".to_string()),
            }));
        }

        if has_results {
            results
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn definitions(&self) -> Vec<Value> {
            vec![json!({ "type": "function", "function": { "name": "echo_text" } })]
        }

        async fn execute(&self, _user_id: i64, _tool_name: &str, arguments: &Value) -> Option<String> {
            Some(arguments["text"].as_str().unwrap_or_default().to_string())
        }
    }

    struct SilentTool;

    #[async_trait]
    impl Tool for SilentTool {
        fn name(&self) -> &'static str {
            "silent"
        }

        fn definitions(&self) -> Vec<Value> {
            vec![json!({ "type": "function", "function": { "name": "fire_and_forget" } })]
        }

        async fn execute(&self, _user_id: i64, _tool_name: &str, _arguments: &Value) -> Option<String> {
            None
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(SilentTool));
        registry
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall { id: "call_1".into(), name: name.into(), arguments: arguments.into() }
    }

    #[tokio::test]
    async fn dispatches_to_matching_tool() {
        let results = registry()
            .process_tool_calls(1, &[call("echo_text", r#"{"text":"hi"}"#)], "echo,silent")
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["content"], "hi");
        assert_eq!(results[0]["tool_call_id"], "call_1");
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result() {
        let results = registry()
            .process_tool_calls(1, &[call("nope", "{}")], "echo")
            .await;
        assert_eq!(results[0]["content"], "Unknown tool: nope");
    }

    #[tokio::test]
    async fn disabled_tool_is_not_dispatchable() {
        let results = registry()
            .process_tool_calls(1, &[call("echo_text", "{}")], "silent")
            .await;
        assert_eq!(results[0]["content"], "Unknown tool: echo_text");
        assert!(registry().get_definitions("silent").len() == 1);
    }

    #[tokio::test]
    async fn all_fire_and_forget_returns_empty() {
        let results = registry()
            .process_tool_calls(1, &[call("fire_and_forget", "{}")], "echo,silent")
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn malformed_arguments_become_error_result() {
        let results = registry()
            .process_tool_calls(1, &[call("echo_text", "{not json")], "echo")
            .await;
        let content = results[0]["content"].as_str().unwrap();
        assert!(content.starts_with("Invalid arguments for echo_text"));
    }
}
