//! The thread engine.

pub mod dispatch;
pub mod error;
pub mod factory;
pub mod handler;
pub mod history;
pub mod hooks;
pub mod pricing;
pub mod thread;
pub mod turn;
pub mod usage;

pub use dispatch::{ToolCallOutcome, ToolDispatcher};
pub use error::{ThreadError, ThreadResult};
pub use factory::{new_subagent, new_thread, resolve_alias, select_provider};
pub use handler::{
    ChannelMessageHandler, ConsoleMessageHandler, HandlerEvent, HandlerEventRx, HandlerEventTx,
    MessageHandler, StreamingMessageHandler, StringCollectorHandler,
};
pub use history::History;
pub use hooks::{MessageDecision, TurnHooks, TurnSummary};
pub use pricing::{ModelPricing, pricing_for};
pub use thread::{Backend, SendOptions, StopReason, Thread};
pub use turn::{AssistantTurn, ThinkingBlock, ToolCall, TurnBlock};
pub use usage::Usage;
