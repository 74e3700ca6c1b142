//! Tool execution contract.
//!
//! Concrete tools live outside the engine. This module defines what the
//! engine advertises to the backend (`ToolDefinition`), how it resolves a
//! name to an executor (`ToolRegistry`), and the lifecycle hooks around a
//! call.

pub mod structured;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use structured::{StructuredToolResult, ToolMetadata};

/// Tool schema advertised to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    /// Returns a copy with the name lowercased.
    ///
    /// Anthropic tools keep their declared casing; the OpenAI endpoints get
    /// lowercase names and the registry resolves either form.
    #[must_use]
    pub fn with_lowercase_name(&self) -> Self {
        Self {
            name: self.name.to_ascii_lowercase(),
            ..self.clone()
        }
    }
}

/// Formats a tool outcome for the model.
pub fn stringify_tool_result(result: &str, error: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(error) = error.filter(|e| !e.is_empty()) {
        out.push_str(&format!("<error>\n{error}\n</error>\n"));
    }
    let result = if result.is_empty() { "(No output)" } else { result };
    out.push_str(&format!("<result>\n{result}\n</result>\n"));
    out
}

/// What a tool executor hands back: the string the model sees plus the
/// structured record kept for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    /// Shorter text for display and tool-execution logs
    pub user_facing: Option<String>,
    pub result: StructuredToolResult,
}

impl ToolOutput {
    pub fn success(tool_name: &str, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            user_facing: None,
            result: StructuredToolResult::success(tool_name, None),
        }
    }

    pub fn failure(tool_name: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            content: stringify_tool_result("", Some(&error)),
            user_facing: Some(error.clone()),
            result: StructuredToolResult::failure(tool_name, error),
        }
    }

    pub fn blocked(tool_name: &str, reason: &str) -> Self {
        Self {
            content: format!(
                "<error>\nTool execution was blocked by security hook: {reason}\n</error>\n"
            ),
            user_facing: Some(format!("blocked: {reason}")),
            result: StructuredToolResult::blocked(tool_name, reason),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: ToolMetadata) -> Self {
        self.result.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn with_user_facing(mut self, text: impl Into<String>) -> Self {
        self.user_facing = Some(text.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.result.success
    }

    pub fn user_facing(&self) -> &str {
        self.user_facing.as_deref().unwrap_or(&self.content)
    }
}

/// Per-call execution context.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub working_dir: PathBuf,
    /// Upper bound for blocking tools
    pub timeout: Option<Duration>,
    /// Cancelled when the caller aborts the turn
    pub cancel: CancellationToken,
    pub is_sub_agent: bool,
}

impl ToolContext {
    pub fn new(call_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            call_id: call_id.into(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout: None,
            cancel,
            is_sub_agent: false,
        }
    }
}

/// Async tool handler function.
pub type ToolFuture = BoxFuture<'static, ToolOutput>;
pub type ToolHandler = Arc<dyn Fn(&Value, &ToolContext) -> ToolFuture + Send + Sync>;

/// Outcome of a `before_tool_call` hook.
#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    /// Run the tool with this (possibly rewritten) input
    Allow(Value),
    Block(String),
}

/// Lifecycle hooks around every tool call.
#[async_trait]
pub trait ToolHooks: Send + Sync {
    async fn before_tool_call(&self, _name: &str, input: &Value, _call_id: &str) -> HookDecision {
        HookDecision::Allow(input.clone())
    }

    /// Returning `Some` replaces the structured result.
    async fn after_tool_call(
        &self,
        _name: &str,
        _input: &Value,
        _call_id: &str,
        _result: &StructuredToolResult,
    ) -> Option<StructuredToolResult> {
        None
    }
}

/// Tool registry (definitions + executors). Names resolve case-insensitively.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    definitions: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("definitions", &self.definitions)
            .field("handlers_len", &self.handlers.len())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tool(mut self, definition: ToolDefinition, handler: ToolHandler) -> Self {
        self.register(definition, handler);
        self
    }

    /// Registers a tool, replacing any tool with the same name.
    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) {
        self.definitions
            .retain(|t| !t.name.eq_ignore_ascii_case(&definition.name));
        self.handlers
            .insert(definition.name.to_ascii_lowercase(), handler);
        self.definitions.push(definition);
    }

    /// Registers a synchronous tool. It runs on the blocking pool and is
    /// bounded by `ToolContext::timeout`.
    pub fn register_blocking<F>(&mut self, definition: ToolDefinition, f: F)
    where
        F: Fn(&Value, &ToolContext) -> ToolOutput + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let tool_name = definition.name.clone();
        self.register(
            definition,
            Arc::new(move |input, ctx| {
                let f = Arc::clone(&f);
                let input = input.clone();
                let ctx = ctx.clone();
                let tool_name = tool_name.clone();
                Box::pin(async move {
                    let timeout = ctx.timeout;
                    execute_blocking(&tool_name, timeout, move || f(&input, &ctx)).await
                })
            }),
        );
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Returns a registry restricted to `allowed` (empty keeps everything).
    #[must_use]
    pub fn filtered(&self, allowed: &[String]) -> Self {
        if allowed.is_empty() {
            return self.clone();
        }
        let keep = |name: &str| allowed.iter().any(|a| a.trim().eq_ignore_ascii_case(name));
        Self {
            definitions: self
                .definitions
                .iter()
                .filter(|t| keep(&t.name))
                .cloned()
                .collect(),
            handlers: self
                .handlers
                .iter()
                .filter(|(name, _)| keep(name))
                .map(|(name, handler)| (name.clone(), Arc::clone(handler)))
                .collect(),
        }
    }

    /// Runs a tool by name. Unknown tools produce a failed output listing the
    /// available names.
    pub async fn execute(&self, name: &str, input: &Value, ctx: &ToolContext) -> ToolOutput {
        match self.handlers.get(&name.to_ascii_lowercase()) {
            Some(handler) => handler(input, ctx).await,
            None => {
                let mut available: Vec<_> =
                    self.definitions.iter().map(|t| t.name.as_str()).collect();
                available.sort_unstable();
                ToolOutput::failure(
                    name,
                    format!(
                        "Unknown tool: {name}. Available tools: {}",
                        available.join(", ")
                    ),
                )
            }
        }
    }
}

async fn execute_blocking<F>(tool_name: &str, timeout: Option<Duration>, f: F) -> ToolOutput
where
    F: FnOnce() -> ToolOutput + Send + 'static,
{
    let mut handle = tokio::task::spawn_blocking(f);

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return ToolOutput::failure(
                    tool_name,
                    format!("Tool execution timed out after {} seconds", limit.as_secs()),
                );
            }
        },
        None => handle.await,
    };

    joined.unwrap_or_else(|_| ToolOutput::failure(tool_name, "Tool execution panicked"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_definition(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: "Echo the input".to_string(),
            input_schema: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        }
    }

    fn echo_handler() -> ToolHandler {
        Arc::new(|input, _ctx| {
            let text = input["text"].as_str().unwrap_or_default().to_string();
            Box::pin(async move { ToolOutput::success("echo", text) })
        })
    }

    fn ctx() -> ToolContext {
        ToolContext::new("call_1", CancellationToken::new())
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let registry = ToolRegistry::new().with_tool(echo_definition("Echo"), echo_handler());
        let output = registry.execute("echo", &json!({"text": "hi"}), &ctx()).await;
        assert!(output.is_success());
        assert_eq!(output.content, "hi");
        assert!(registry.contains("ECHO"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_failed_result() {
        let registry = ToolRegistry::new().with_tool(echo_definition("echo"), echo_handler());
        let output = registry.execute("rm_rf", &json!({}), &ctx()).await;
        assert!(!output.is_success());
        assert!(output.content.contains("Unknown tool: rm_rf"));
        assert!(output.content.contains("echo"));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_definition("echo"), echo_handler());
        registry.register(echo_definition("ECHO"), echo_handler());
        assert_eq!(registry.definitions().len(), 1);
        assert_eq!(registry.definitions()[0].name, "ECHO");
    }

    #[test]
    fn test_filtered_keeps_allowed_tools() {
        let registry = ToolRegistry::new()
            .with_tool(echo_definition("echo"), echo_handler())
            .with_tool(echo_definition("read"), echo_handler());

        let filtered = registry.filtered(&["Read".to_string()]);
        assert_eq!(filtered.definitions().len(), 1);
        assert!(filtered.contains("read"));
        assert!(!filtered.contains("echo"));

        assert_eq!(registry.filtered(&[]).definitions().len(), 2);
    }

    #[tokio::test]
    async fn test_blocking_tool_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register_blocking(echo_definition("slow"), |_input, _ctx| {
            std::thread::sleep(Duration::from_millis(200));
            ToolOutput::success("slow", "late")
        });

        let mut ctx = ctx();
        ctx.timeout = Some(Duration::from_millis(10));
        let output = registry.execute("slow", &json!({}), &ctx).await;
        assert!(!output.is_success());
        assert!(output.result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_stringify_tool_result() {
        assert_eq!(
            stringify_tool_result("", Some("boom")),
            "<error>\nboom\n</error>\n<result>\n(No output)\n</result>\n"
        );
        assert_eq!(stringify_tool_result("ok", None), "<result>\nok\n</result>\n");
    }
}
