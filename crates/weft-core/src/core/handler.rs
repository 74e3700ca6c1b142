//! Message handlers: how a thread reports progress to its caller.
//!
//! Every handler receives whole-message callbacks. A handler that wants
//! incremental rendering also implements [`StreamingMessageHandler`] and
//! returns itself from [`MessageHandler::as_streaming`]; the turn loop then
//! sends deltas and block boundaries instead of whole text/thinking blocks.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::tools::ToolOutput;

pub trait MessageHandler: Send + Sync {
    /// Full assistant text of one exchange (non-streaming handlers only).
    fn handle_text(&self, text: &str);
    /// A tool call is about to run. `input` is the raw argument JSON.
    fn handle_tool_use(&self, call_id: &str, name: &str, input: &str);
    fn handle_tool_result(&self, call_id: &str, name: &str, result: &ToolOutput);
    /// Full reasoning text of one block (non-streaming handlers only).
    fn handle_thinking(&self, thinking: &str);
    /// Fires once per `send_message`, whatever the outcome.
    fn handle_done(&self);

    fn as_streaming(&self) -> Option<&dyn StreamingMessageHandler> {
        None
    }
}

pub trait StreamingMessageHandler: MessageHandler {
    fn handle_text_delta(&self, delta: &str);
    fn handle_thinking_start(&self);
    fn handle_thinking_delta(&self, delta: &str);
    fn handle_thinking_block_end(&self);
    fn handle_content_block_end(&self);
}

/// Prints to stdout. `silent` suppresses everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleMessageHandler {
    pub silent: bool,
}

impl ConsoleMessageHandler {
    pub fn new(silent: bool) -> Self {
        Self { silent }
    }
}

impl MessageHandler for ConsoleMessageHandler {
    fn handle_text(&self, text: &str) {
        if !self.silent {
            println!("{text}\n");
        }
    }

    fn handle_tool_use(&self, _call_id: &str, name: &str, input: &str) {
        if !self.silent {
            println!("🔧 Using tool: {name}: {input}");
        }
    }

    fn handle_tool_result(&self, _call_id: &str, _name: &str, result: &ToolOutput) {
        if !self.silent {
            println!("🔄 Tool result: {}\n", result.user_facing());
        }
    }

    fn handle_thinking(&self, thinking: &str) {
        if !self.silent {
            println!("💭 Thinking: {thinking}\n");
        }
    }

    fn handle_done(&self) {
        if !self.silent {
            println!("✅ Done");
        }
    }

    fn as_streaming(&self) -> Option<&dyn StreamingMessageHandler> {
        Some(self)
    }
}

impl StreamingMessageHandler for ConsoleMessageHandler {
    fn handle_text_delta(&self, delta: &str) {
        if !self.silent {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
    }

    fn handle_thinking_start(&self) {
        if !self.silent {
            print!("💭 ");
        }
    }

    fn handle_thinking_delta(&self, delta: &str) {
        if !self.silent {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
    }

    fn handle_thinking_block_end(&self) {
        if !self.silent {
            println!("\n");
        }
    }

    fn handle_content_block_end(&self) {
        if !self.silent {
            println!();
        }
    }
}

/// Collects assistant text. Used for summaries, compaction and sub-agents.
#[derive(Debug, Default)]
pub struct StringCollectorHandler {
    pub silent: bool,
    text: Mutex<String>,
}

impl StringCollectorHandler {
    pub fn new(silent: bool) -> Self {
        Self {
            silent,
            text: Mutex::new(String::new()),
        }
    }

    pub fn collected_text(&self) -> String {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MessageHandler for StringCollectorHandler {
    fn handle_text(&self, text: &str) {
        let mut buf = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        buf.push_str(text);
        buf.push('\n');
        if !self.silent {
            println!("{text}");
        }
    }

    fn handle_tool_use(&self, _call_id: &str, name: &str, _input: &str) {
        if !self.silent {
            println!("🔧 Using tool: {name}");
        }
    }

    fn handle_tool_result(&self, _call_id: &str, _name: &str, _result: &ToolOutput) {}

    fn handle_thinking(&self, _thinking: &str) {}

    fn handle_done(&self) {}
}

/// Events forwarded by [`ChannelMessageHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Text(String),
    TextDelta(String),
    ToolUse {
        call_id: String,
        name: String,
        input: String,
    },
    ToolResult {
        call_id: String,
        name: String,
        output: ToolOutput,
    },
    Thinking(String),
    ThinkingStart,
    ThinkingDelta(String),
    ThinkingBlockEnd,
    ContentBlockEnd,
    Done,
}

pub type HandlerEventTx = mpsc::UnboundedSender<HandlerEvent>;
pub type HandlerEventRx = mpsc::UnboundedReceiver<HandlerEvent>;

/// Forwards every callback to a display layer running on another task.
///
/// Sends never block the turn loop. Once the receiver is dropped events are
/// discarded.
#[derive(Debug, Clone)]
pub struct ChannelMessageHandler {
    tx: HandlerEventTx,
}

impl ChannelMessageHandler {
    pub fn new(tx: HandlerEventTx) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, HandlerEventRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: HandlerEvent) {
        let _ = self.tx.send(event);
    }
}

impl MessageHandler for ChannelMessageHandler {
    fn handle_text(&self, text: &str) {
        self.send(HandlerEvent::Text(text.to_string()));
    }

    fn handle_tool_use(&self, call_id: &str, name: &str, input: &str) {
        self.send(HandlerEvent::ToolUse {
            call_id: call_id.to_string(),
            name: name.to_string(),
            input: input.to_string(),
        });
    }

    fn handle_tool_result(&self, call_id: &str, name: &str, result: &ToolOutput) {
        self.send(HandlerEvent::ToolResult {
            call_id: call_id.to_string(),
            name: name.to_string(),
            output: result.clone(),
        });
    }

    fn handle_thinking(&self, thinking: &str) {
        self.send(HandlerEvent::Thinking(thinking.to_string()));
    }

    fn handle_done(&self) {
        self.send(HandlerEvent::Done);
    }

    fn as_streaming(&self) -> Option<&dyn StreamingMessageHandler> {
        Some(self)
    }
}

impl StreamingMessageHandler for ChannelMessageHandler {
    fn handle_text_delta(&self, delta: &str) {
        self.send(HandlerEvent::TextDelta(delta.to_string()));
    }

    fn handle_thinking_start(&self) {
        self.send(HandlerEvent::ThinkingStart);
    }

    fn handle_thinking_delta(&self, delta: &str) {
        self.send(HandlerEvent::ThinkingDelta(delta.to_string()));
    }

    fn handle_thinking_block_end(&self) {
        self.send(HandlerEvent::ThinkingBlockEnd);
    }

    fn handle_content_block_end(&self) {
        self.send(HandlerEvent::ContentBlockEnd);
    }
}
