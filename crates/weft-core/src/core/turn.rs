//! Folds one exchange's stream events into an assistant turn while driving
//! the handler callbacks.
//!
//! Blocks are tracked by stream index in first-seen order, so the finished
//! turn keeps reasoning, text and tool calls in the order the backend
//! produced them. At most one display block (text or thinking) is open at a
//! time; switching kind closes the open one first, even when the backend
//! never sent an explicit stop for it.

use serde_json::{Value, json};
use tracing::debug;

use super::handler::{MessageHandler, StreamingMessageHandler};
use crate::providers::{ContentBlockType, ProviderError, StreamEvent, TokenUsage};

/// A finished tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw argument string as the backend sent it
    pub arguments: String,
    pub input: Value,
    /// Set when `arguments` was not valid JSON
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThinkingBlock {
    pub text: String,
    pub signature: String,
    /// Responses reasoning item id and encrypted payload, for replay
    pub replay_id: Option<String>,
    pub encrypted_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnBlock {
    Thinking(ThinkingBlock),
    Text(String),
    ToolCall(ToolCall),
}

/// Everything one backend response contributed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub blocks: Vec<TurnBlock>,
    pub stop_reason: Option<String>,
    pub usage: TokenUsage,
    pub model: Option<String>,
}

impl AssistantTurn {
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                TurnBlock::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.blocks.iter().filter_map(|b| match b {
            TurnBlock::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }

    /// No text, no reasoning, no tool calls.
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| match b {
            TurnBlock::Text(text) => text.trim().is_empty(),
            TurnBlock::Thinking(t) => t.text.is_empty() && t.encrypted_content.is_none(),
            TurnBlock::ToolCall(_) => false,
        })
    }
}

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    Thinking(ThinkingBlock),
    Tool {
        id: String,
        name: String,
        arguments: String,
        finalized: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Text,
    Thinking,
}

/// Consumes [`StreamEvent`]s for one exchange.
pub(crate) struct TurnCollector<'h> {
    handler: &'h dyn MessageHandler,
    streaming: Option<&'h dyn StreamingMessageHandler>,
    blocks: Vec<(usize, PartialBlock)>,
    open: Option<(usize, OpenKind)>,
    stop_reason: Option<String>,
    usage: TokenUsage,
    model: Option<String>,
    completed: bool,
}

impl<'h> TurnCollector<'h> {
    pub(crate) fn new(handler: &'h dyn MessageHandler) -> Self {
        Self {
            handler,
            streaming: handler.as_streaming(),
            blocks: Vec::new(),
            open: None,
            stop_reason: None,
            usage: TokenUsage::default(),
            model: None,
            completed: false,
        }
    }

    /// Whether the backend signalled the end of its response. A stream that
    /// stops without it was cut off.
    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    /// Applies one event.
    ///
    /// # Errors
    /// A backend-reported error event ends the exchange.
    pub(crate) fn apply(&mut self, event: StreamEvent) -> Result<(), ProviderError> {
        match event {
            StreamEvent::MessageStart { model, usage } => {
                if !model.is_empty() {
                    self.model = Some(model);
                }
                self.usage.merge(usage);
            }
            StreamEvent::ContentBlockStart {
                index,
                block_type,
                id,
                name,
            } => match block_type {
                ContentBlockType::Text => self.open_block(index, OpenKind::Text),
                ContentBlockType::Reasoning => self.open_block(index, OpenKind::Thinking),
                ContentBlockType::ToolUse => {
                    self.close_open();
                    let id = id.unwrap_or_else(|| format!("call_{index}"));
                    debug!(index, tool_id = %id, "tool use block started");
                    self.blocks.push((
                        index,
                        PartialBlock::Tool {
                            id,
                            name: name.unwrap_or_default(),
                            arguments: String::new(),
                            finalized: false,
                        },
                    ));
                }
            },
            StreamEvent::TextDelta { index, text } => {
                if text.is_empty() {
                    return Ok(());
                }
                self.open_block(index, OpenKind::Text);
                if let Some(PartialBlock::Text(buf)) = self.block_mut(index) {
                    buf.push_str(&text);
                }
                if let Some(s) = self.streaming {
                    s.handle_text_delta(&text);
                }
            }
            StreamEvent::ReasoningDelta { index, reasoning } => {
                if reasoning.is_empty() {
                    return Ok(());
                }
                self.open_block(index, OpenKind::Thinking);
                if let Some(PartialBlock::Thinking(block)) = self.block_mut(index) {
                    block.text.push_str(&reasoning);
                }
                if let Some(s) = self.streaming {
                    s.handle_thinking_delta(&reasoning);
                }
            }
            StreamEvent::ReasoningSignatureDelta { index, signature } => {
                if let Some(PartialBlock::Thinking(block)) = self.block_mut(index) {
                    block.signature.push_str(&signature);
                }
            }
            StreamEvent::ReasoningCompleted {
                index,
                id,
                encrypted_content,
                summary,
            } => {
                if self.block_mut(index).is_none() {
                    self.blocks
                        .push((index, PartialBlock::Thinking(ThinkingBlock::default())));
                }
                if let Some(PartialBlock::Thinking(block)) = self.block_mut(index) {
                    block.replay_id = Some(id);
                    block.encrypted_content = encrypted_content;
                    if block.text.is_empty()
                        && let Some(summary) = summary
                    {
                        block.text = summary;
                    }
                }
                if self.open.is_some_and(|(i, _)| i == index) {
                    self.close_open();
                }
            }
            StreamEvent::InputJsonDelta {
                index,
                partial_json,
            } => {
                self.close_open();
                if let Some(PartialBlock::Tool {
                    arguments,
                    finalized: false,
                    ..
                }) = self.block_mut(index)
                {
                    arguments.push_str(&partial_json);
                }
            }
            StreamEvent::InputJsonFinal {
                index,
                arguments: final_args,
            } => {
                self.close_open();
                if let Some(PartialBlock::Tool {
                    arguments,
                    finalized,
                    ..
                }) = self.block_mut(index)
                {
                    *arguments = final_args;
                    *finalized = true;
                }
            }
            StreamEvent::ContentBlockCompleted { index } => {
                if self.open.is_some_and(|(i, _)| i == index) {
                    self.close_open();
                }
            }
            StreamEvent::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if let Some(usage) = usage {
                    self.usage.merge(usage);
                }
            }
            StreamEvent::MessageCompleted => {
                self.close_open();
                self.completed = true;
            }
            StreamEvent::Ping => {}
            StreamEvent::Error {
                error_type,
                message,
            } => {
                self.close_open();
                return Err(ProviderError::api_error(&error_type, &message));
            }
        }
        Ok(())
    }

    /// Closes any open block and returns the finished turn. Non-streaming
    /// handlers get the whole reasoning and text blocks here.
    pub(crate) fn finish(mut self) -> AssistantTurn {
        self.close_open();

        let blocks: Vec<TurnBlock> = self
            .blocks
            .into_iter()
            .filter_map(|(_, block)| match block {
                PartialBlock::Text(text) => (!text.is_empty()).then_some(TurnBlock::Text(text)),
                PartialBlock::Thinking(t) => (!t.text.is_empty() || t.encrypted_content.is_some())
                    .then_some(TurnBlock::Thinking(t)),
                PartialBlock::Tool {
                    id,
                    name,
                    arguments,
                    ..
                } => Some(TurnBlock::ToolCall(finalize_tool_call(id, name, arguments))),
            })
            .collect();

        if self.streaming.is_none() {
            for block in &blocks {
                match block {
                    TurnBlock::Thinking(t) if !t.text.is_empty() => {
                        self.handler.handle_thinking(&t.text);
                    }
                    TurnBlock::Text(text) if !text.trim().is_empty() => {
                        self.handler.handle_text(text.trim());
                    }
                    _ => {}
                }
            }
        }

        AssistantTurn {
            blocks,
            stop_reason: self.stop_reason,
            usage: self.usage,
            model: self.model,
        }
    }

    fn block_mut(&mut self, index: usize) -> Option<&mut PartialBlock> {
        self.blocks
            .iter_mut()
            .find(|(i, _)| *i == index)
            .map(|(_, b)| b)
    }

    fn open_block(&mut self, index: usize, kind: OpenKind) {
        if self.open == Some((index, kind)) {
            return;
        }
        self.close_open();
        if self.block_mut(index).is_none() {
            let block = match kind {
                OpenKind::Text => PartialBlock::Text(String::new()),
                OpenKind::Thinking => PartialBlock::Thinking(ThinkingBlock::default()),
            };
            self.blocks.push((index, block));
        }
        self.open = Some((index, kind));
        if kind == OpenKind::Thinking
            && let Some(s) = self.streaming
        {
            s.handle_thinking_start();
        }
    }

    fn close_open(&mut self) {
        let Some((_, kind)) = self.open.take() else {
            return;
        };
        if let Some(s) = self.streaming {
            match kind {
                OpenKind::Thinking => s.handle_thinking_block_end(),
                OpenKind::Text => s.handle_content_block_end(),
            }
        }
    }
}

/// Parses tool arguments. Empty arguments mean `{}`; malformed JSON keeps
/// the raw text so the call can still be recorded and answered.
fn finalize_tool_call(id: String, name: String, arguments: String) -> ToolCall {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return ToolCall {
            id,
            name,
            arguments: "{}".to_string(),
            input: json!({}),
            parse_error: None,
        };
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(input) => ToolCall {
            id,
            name,
            arguments,
            input,
            parse_error: None,
        },
        Err(err) => ToolCall {
            id,
            name,
            input: json!({ "_raw_malformed": arguments }),
            arguments,
            parse_error: Some(err.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::tools::ToolOutput;

    #[derive(Default)]
    struct Recorder {
        streaming: bool,
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn streaming() -> Self {
            Self {
                streaming: true,
                ..Self::default()
            }
        }

        fn push(&self, s: impl Into<String>) {
            self.calls.lock().unwrap().push(s.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl MessageHandler for Recorder {
        fn handle_text(&self, text: &str) {
            self.push(format!("text:{text}"));
        }
        fn handle_tool_use(&self, _call_id: &str, name: &str, _input: &str) {
            self.push(format!("tool_use:{name}"));
        }
        fn handle_tool_result(&self, _call_id: &str, name: &str, _result: &ToolOutput) {
            self.push(format!("tool_result:{name}"));
        }
        fn handle_thinking(&self, thinking: &str) {
            self.push(format!("thinking:{thinking}"));
        }
        fn handle_done(&self) {
            self.push("done");
        }
        fn as_streaming(&self) -> Option<&dyn StreamingMessageHandler> {
            self.streaming.then_some(self as &dyn StreamingMessageHandler)
        }
    }

    impl StreamingMessageHandler for Recorder {
        fn handle_text_delta(&self, delta: &str) {
            self.push(format!("delta:{delta}"));
        }
        fn handle_thinking_start(&self) {
            self.push("thinking_start");
        }
        fn handle_thinking_delta(&self, delta: &str) {
            self.push(format!("thinking_delta:{delta}"));
        }
        fn handle_thinking_block_end(&self) {
            self.push("thinking_end");
        }
        fn handle_content_block_end(&self) {
            self.push("block_end");
        }
    }

    fn tool_start(index: usize, id: &str, name: &str) -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index,
            block_type: ContentBlockType::ToolUse,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
        }
    }

    #[test]
    fn test_synthesizes_block_end_before_tool_arguments() {
        let recorder = Recorder::streaming();
        let mut collector = TurnCollector::new(&recorder);
        collector
            .apply(StreamEvent::TextDelta {
                index: 0,
                text: "Let me look".to_string(),
            })
            .unwrap();
        collector.apply(tool_start(1, "call_1", "bash")).unwrap();
        collector
            .apply(StreamEvent::InputJsonDelta {
                index: 1,
                partial_json: "{\"command\":\"ls\"}".to_string(),
            })
            .unwrap();
        let turn = collector.finish();

        assert_eq!(
            recorder.calls(),
            vec!["delta:Let me look".to_string(), "block_end".to_string()]
        );
        assert_eq!(turn.text(), "Let me look");
        let call = turn.tool_calls().next().unwrap();
        assert_eq!(call.input, json!({"command": "ls"}));
    }

    #[test]
    fn test_thinking_then_text_switch_closes_thinking() {
        let recorder = Recorder::streaming();
        let mut collector = TurnCollector::new(&recorder);
        for event in [
            StreamEvent::ReasoningDelta {
                index: 0,
                reasoning: "hmm".to_string(),
            },
            StreamEvent::TextDelta {
                index: 1,
                text: "Hi".to_string(),
            },
            StreamEvent::MessageCompleted,
        ] {
            collector.apply(event).unwrap();
        }
        let turn = collector.finish();

        assert_eq!(
            recorder.calls(),
            vec![
                "thinking_start",
                "thinking_delta:hmm",
                "thinking_end",
                "delta:Hi",
                "block_end"
            ]
        );
        assert!(matches!(&turn.blocks[0], TurnBlock::Thinking(t) if t.text == "hmm"));
        assert!(matches!(&turn.blocks[1], TurnBlock::Text(t) if t == "Hi"));
    }

    #[test]
    fn test_final_arguments_replace_deltas() {
        let recorder = Recorder::default();
        let mut collector = TurnCollector::new(&recorder);
        collector.apply(tool_start(0, "call_1", "read")).unwrap();
        collector
            .apply(StreamEvent::InputJsonDelta {
                index: 0,
                partial_json: "{\"path\":\"a".to_string(),
            })
            .unwrap();
        collector
            .apply(StreamEvent::InputJsonFinal {
                index: 0,
                arguments: "{\"path\":\"b.txt\"}".to_string(),
            })
            .unwrap();
        // Late deltas after the final payload are ignored
        collector
            .apply(StreamEvent::InputJsonDelta {
                index: 0,
                partial_json: "garbage".to_string(),
            })
            .unwrap();
        let turn = collector.finish();

        let call = turn.tool_calls().next().unwrap();
        assert_eq!(call.arguments, "{\"path\":\"b.txt\"}");
        assert_eq!(call.input, json!({"path": "b.txt"}));
    }

    #[test]
    fn test_malformed_arguments_are_kept_raw() {
        let recorder = Recorder::default();
        let mut collector = TurnCollector::new(&recorder);
        collector.apply(tool_start(0, "call_1", "bash")).unwrap();
        collector
            .apply(StreamEvent::InputJsonDelta {
                index: 0,
                partial_json: "{\"command\": ".to_string(),
            })
            .unwrap();
        let turn = collector.finish();

        let call = turn.tool_calls().next().unwrap();
        assert!(call.parse_error.is_some());
        assert_eq!(call.input, json!({"_raw_malformed": "{\"command\": "}));
    }

    #[test]
    fn test_empty_arguments_become_empty_object() {
        let recorder = Recorder::default();
        let mut collector = TurnCollector::new(&recorder);
        collector.apply(tool_start(0, "call_1", "list")).unwrap();
        let turn = collector.finish();
        let call = turn.tool_calls().next().unwrap();
        assert_eq!(call.input, json!({}));
        assert!(call.parse_error.is_none());
    }

    #[test]
    fn test_non_streaming_handler_gets_whole_blocks() {
        let recorder = Recorder::default();
        let mut collector = TurnCollector::new(&recorder);
        for event in [
            StreamEvent::ReasoningDelta {
                index: 0,
                reasoning: "think ".to_string(),
            },
            StreamEvent::ReasoningDelta {
                index: 0,
                reasoning: "more".to_string(),
            },
            StreamEvent::TextDelta {
                index: 1,
                text: "Hello ".to_string(),
            },
            StreamEvent::TextDelta {
                index: 1,
                text: "world".to_string(),
            },
        ] {
            collector.apply(event).unwrap();
        }
        collector.finish();
        assert_eq!(
            recorder.calls(),
            vec!["thinking:think more", "text:Hello world"]
        );
    }

    #[test]
    fn test_usage_and_stop_reason_are_collected() {
        let recorder = Recorder::default();
        let mut collector = TurnCollector::new(&recorder);
        collector
            .apply(StreamEvent::MessageStart {
                model: "claude-sonnet-4-20250514".to_string(),
                usage: TokenUsage {
                    input_tokens: 120,
                    ..TokenUsage::default()
                },
            })
            .unwrap();
        collector
            .apply(StreamEvent::MessageDelta {
                stop_reason: Some("end_turn".to_string()),
                usage: Some(TokenUsage {
                    output_tokens: 30,
                    ..TokenUsage::default()
                }),
            })
            .unwrap();
        let turn = collector.finish();
        assert_eq!(turn.usage.input_tokens, 120);
        assert_eq!(turn.usage.output_tokens, 30);
        assert_eq!(turn.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(turn.model.as_deref(), Some("claude-sonnet-4-20250514"));
        assert!(turn.is_empty());
    }

    #[test]
    fn test_only_message_completed_marks_the_response_complete() {
        let recorder = Recorder::default();
        let mut collector = TurnCollector::new(&recorder);
        collector
            .apply(StreamEvent::TextDelta {
                index: 0,
                text: "The answer is defin".to_string(),
            })
            .unwrap();
        collector
            .apply(StreamEvent::MessageDelta {
                stop_reason: Some("end_turn".to_string()),
                usage: None,
            })
            .unwrap();
        assert!(!collector.is_completed());

        collector.apply(StreamEvent::MessageCompleted).unwrap();
        assert!(collector.is_completed());
    }

    #[test]
    fn test_error_event_fails_the_exchange() {
        let recorder = Recorder::default();
        let mut collector = TurnCollector::new(&recorder);
        let err = collector
            .apply(StreamEvent::Error {
                error_type: "overloaded_error".to_string(),
                message: "Overloaded".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.message, "overloaded_error: Overloaded");
    }

    #[test]
    fn test_reasoning_completion_keeps_replay_payload() {
        let recorder = Recorder::default();
        let mut collector = TurnCollector::new(&recorder);
        collector
            .apply(StreamEvent::ReasoningCompleted {
                index: 0,
                id: "rs_1".to_string(),
                encrypted_content: Some("enc".to_string()),
                summary: Some("Planned".to_string()),
            })
            .unwrap();
        let turn = collector.finish();
        match &turn.blocks[0] {
            TurnBlock::Thinking(t) => {
                assert_eq!(t.text, "Planned");
                assert_eq!(t.replay_id.as_deref(), Some("rs_1"));
                assert_eq!(t.encrypted_content.as_deref(), Some("enc"));
            }
            other => panic!("unexpected block {other:?}"),
        }
    }
}
