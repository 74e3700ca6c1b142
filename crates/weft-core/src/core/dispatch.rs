//! Tool dispatch bridge: runs the tool calls of one assistant turn.
//!
//! Calls run concurrently on a `JoinSet`. Tool failures come back as failed
//! structured results; only a task that cannot be joined (panic) is an
//! engine error. Cancellation aborts every running task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{ThreadError, ThreadResult};
use super::handler::MessageHandler;
use super::turn::ToolCall;
use crate::tools::{HookDecision, ToolContext, ToolDefinition, ToolHooks, ToolOutput, ToolRegistry};

/// A finished call: what ran and what came back.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub call_id: String,
    pub name: String,
    /// Input after `before_tool_call` hooks
    pub input: Value,
    pub output: ToolOutput,
}

#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    hooks: Option<Arc<dyn ToolHooks>>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
    is_sub_agent: bool,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("registry", &self.registry)
            .field("has_hooks", &self.hooks.is_some())
            .field("working_dir", &self.working_dir)
            .field("is_sub_agent", &self.is_sub_agent)
            .finish_non_exhaustive()
    }
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new(ToolRegistry::new())
    }
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            hooks: None,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout: None,
            is_sub_agent: false,
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn ToolHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Upper bound applied to blocking tools.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn for_sub_agent(&self, allowed_tools: &[String]) -> Self {
        Self {
            registry: Arc::new(self.registry.filtered(allowed_tools)),
            is_sub_agent: true,
            ..self.clone()
        }
    }

    /// Restricts the advertised and executable tools.
    #[must_use]
    pub fn filtered(&self, allowed_tools: &[String]) -> Self {
        if allowed_tools.is_empty() {
            return self.clone();
        }
        Self {
            registry: Arc::new(self.registry.filtered(allowed_tools)),
            ..self.clone()
        }
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        self.registry.definitions()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs every call and returns outcomes in call order.
    ///
    /// # Errors
    /// `Cancelled` when `cancel` fires first, `ToolInfrastructure` when a
    /// tool task panics.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        handler: &dyn MessageHandler,
        cancel: &CancellationToken,
    ) -> ThreadResult<Vec<ToolCallOutcome>> {
        let mut outcomes: Vec<Option<ToolCallOutcome>> = vec![None; calls.len()];
        let mut join_set: JoinSet<ToolOutput> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, (usize, Value)> = HashMap::new();

        for (i, call) in calls.iter().enumerate() {
            handler.handle_tool_use(&call.id, &call.name, &call.arguments);

            if let Some(err) = &call.parse_error {
                warn!(
                    tool = %call.name,
                    call_id = %call.id,
                    error = %err,
                    "malformed tool arguments"
                );
                let output = ToolOutput::failure(
                    &call.name,
                    format!("Invalid JSON arguments for tool '{}': {err}", call.name),
                );
                handler.handle_tool_result(&call.id, &call.name, &output);
                outcomes[i] = Some(outcome(call, call.input.clone(), output));
                continue;
            }

            let decision = match &self.hooks {
                Some(hooks) => {
                    hooks
                        .before_tool_call(&call.name, &call.input, &call.id)
                        .await
                }
                None => HookDecision::Allow(call.input.clone()),
            };
            let input = match decision {
                HookDecision::Allow(input) => input,
                HookDecision::Block(reason) => {
                    debug!(tool = %call.name, %reason, "tool call blocked by hook");
                    let output = ToolOutput::blocked(&call.name, &reason);
                    handler.handle_tool_result(&call.id, &call.name, &output);
                    outcomes[i] = Some(outcome(call, call.input.clone(), output));
                    continue;
                }
            };

            let ctx = ToolContext {
                call_id: call.id.clone(),
                working_dir: self.working_dir.clone(),
                timeout: self.timeout,
                cancel: cancel.child_token(),
                is_sub_agent: self.is_sub_agent,
            };
            let registry = Arc::clone(&self.registry);
            let name = call.name.clone();
            let task_input = input.clone();
            let handle =
                join_set.spawn(async move { registry.execute(&name, &task_input, &ctx).await });
            running.insert(handle.id(), (i, input));
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    join_set.abort_all();
                    debug!(pending = join_set.len(), "tool execution cancelled");
                    return Err(ThreadError::Cancelled);
                }
                joined = join_set.join_next_with_id() => {
                    match joined {
                        Some(Ok((id, mut output))) => {
                            let Some((i, input)) = running.remove(&id) else {
                                continue;
                            };
                            let call = &calls[i];
                            if let Some(hooks) = &self.hooks
                                && let Some(replaced) = hooks
                                    .after_tool_call(&call.name, &input, &call.id, &output.result)
                                    .await
                            {
                                output.result = replaced;
                            }
                            handler.handle_tool_result(&call.id, &call.name, &output);
                            outcomes[i] = Some(outcome(call, input, output));
                        }
                        Some(Err(err)) => {
                            join_set.abort_all();
                            let tool = running
                                .get(&err.id())
                                .map(|(i, _)| calls[*i].name.clone())
                                .unwrap_or_default();
                            return Err(ThreadError::ToolInfrastructure {
                                tool,
                                message: err.to_string(),
                            });
                        }
                        None => break,
                    }
                }
            }
        }

        calls
            .iter()
            .zip(outcomes)
            .map(|(call, slot)| {
                slot.ok_or_else(|| ThreadError::ToolInfrastructure {
                    tool: call.name.clone(),
                    message: "tool produced no result".to_string(),
                })
            })
            .collect()
    }
}

fn outcome(call: &ToolCall, input: Value, output: ToolOutput) -> ToolCallOutcome {
    ToolCallOutcome {
        call_id: call.id.clone(),
        name: call.name.clone(),
        input,
        output,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::handler::StringCollectorHandler;
    use crate::tools::StructuredToolResult;

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: json!({"type": "object"}),
        }
    }

    fn call(id: &str, name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: input.to_string(),
            input,
            parse_error: None,
        }
    }

    fn echo_registry() -> ToolRegistry {
        ToolRegistry::new().with_tool(
            def("echo"),
            Arc::new(|input, _ctx| {
                let text = input["text"].as_str().unwrap_or_default().to_string();
                Box::pin(async move { ToolOutput::success("echo", text) })
            }),
        )
    }

    #[tokio::test]
    async fn test_results_come_back_in_call_order() {
        let registry = echo_registry().with_tool(
            def("slow"),
            Arc::new(|_input, _ctx| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    ToolOutput::success("slow", "late")
                })
            }),
        );
        let dispatcher = ToolDispatcher::new(registry);
        let handler = StringCollectorHandler::new(true);
        let outcomes = dispatcher
            .dispatch(
                &[
                    call("1", "slow", json!({})),
                    call("2", "echo", json!({"text": "fast"})),
                ],
                &handler,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcomes[0].output.content, "late");
        assert_eq!(outcomes[1].output.content, "fast");
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_json_are_failed_results() {
        let dispatcher = ToolDispatcher::new(echo_registry());
        let handler = StringCollectorHandler::new(true);
        let mut malformed = call("2", "echo", json!({"_raw_malformed": "{oops"}));
        malformed.arguments = "{oops".to_string();
        malformed.parse_error = Some("expected value".to_string());

        let outcomes = dispatcher
            .dispatch(
                &[call("1", "nope", json!({})), malformed],
                &handler,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcomes[0].output.is_success());
        assert!(outcomes[0].output.content.contains("Unknown tool: nope"));
        assert!(!outcomes[1].output.is_success());
        assert!(outcomes[1].output.content.contains("Invalid JSON arguments"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_running_tools() {
        let registry = ToolRegistry::new().with_tool(
            def("hang"),
            Arc::new(|_input, _ctx| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    ToolOutput::success("hang", "never")
                })
            }),
        );
        let dispatcher = ToolDispatcher::new(registry);
        let handler = StringCollectorHandler::new(true);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = dispatcher
            .dispatch(&[call("1", "hang", json!({}))], &handler, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    fn explode() -> ToolOutput {
        panic!("tool exploded")
    }

    #[tokio::test]
    async fn test_panicking_tool_is_infrastructure_error() {
        let registry = ToolRegistry::new().with_tool(
            def("boom"),
            Arc::new(|_input, _ctx| Box::pin(async { explode() })),
        );
        let dispatcher = ToolDispatcher::new(registry);
        let handler = StringCollectorHandler::new(true);
        let err = dispatcher
            .dispatch(&[call("1", "boom", json!({}))], &handler, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadError::ToolInfrastructure { ref tool, .. } if tool == "boom"));
    }

    struct Guard {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolHooks for Guard {
        async fn before_tool_call(
            &self,
            name: &str,
            input: &Value,
            _call_id: &str,
        ) -> HookDecision {
            self.seen.lock().unwrap().push(name.to_string());
            if input["text"] == "secret" {
                HookDecision::Block("no secrets".to_string())
            } else {
                HookDecision::Allow(json!({"text": "rewritten"}))
            }
        }

        async fn after_tool_call(
            &self,
            name: &str,
            _input: &Value,
            _call_id: &str,
            _result: &StructuredToolResult,
        ) -> Option<StructuredToolResult> {
            Some(StructuredToolResult::failure(name, "overridden"))
        }
    }

    #[tokio::test]
    async fn test_hooks_rewrite_block_and_replace() {
        let hooks = Arc::new(Guard {
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = ToolDispatcher::new(echo_registry()).with_hooks(hooks.clone());
        let handler = StringCollectorHandler::new(true);
        let outcomes = dispatcher
            .dispatch(
                &[
                    call("1", "echo", json!({"text": "secret"})),
                    call("2", "echo", json!({"text": "hello"})),
                ],
                &handler,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcomes[0].output.content.contains("blocked"));
        assert_eq!(
            outcomes[0].output.result.error.as_deref(),
            Some("blocked by hook: no secrets")
        );
        assert_eq!(outcomes[1].input, json!({"text": "rewritten"}));
        assert_eq!(outcomes[1].output.content, "rewritten");
        assert!(!outcomes[1].output.result.success);
        assert_eq!(hooks.seen.lock().unwrap().len(), 2);
    }
}
