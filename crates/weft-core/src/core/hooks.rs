//! Lifecycle hooks around the turn loop.
//!
//! Every method has a pass-through default, so an implementation overrides
//! only the events it cares about. Tool-level hooks live in
//! [`crate::tools::ToolHooks`].

use async_trait::async_trait;

use super::history::History;
use super::usage::Usage;

/// Outcome of a `user_message_send` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDecision {
    Allow,
    /// Reject the message; the reason is reported back to the caller
    Block(String),
}

/// What one finished turn looked like, handed to `after_turn`.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSummary<'a> {
    /// 1-based turn number within the current send
    pub turn: u32,
    pub tools_used: bool,
    /// Cumulative usage of the thread so far
    pub usage: Usage,
    /// Assistant text of this turn
    pub last_output: &'a str,
    pub is_sub_agent: bool,
}

/// Hooks consulted by [`crate::core::Thread::send_message`].
#[async_trait]
pub trait TurnHooks: Send + Sync {
    /// Runs before the user message is appended to the history.
    async fn user_message_send(&self, _text: &str) -> MessageDecision {
        MessageDecision::Allow
    }

    /// Runs after every turn, once its tool results are in the history.
    /// Returning `Some` replaces the history (e.g. after an external
    /// compaction); it must use the thread's provider format.
    async fn after_turn(&self, _summary: &TurnSummary<'_>, _history: &History) -> Option<History> {
        None
    }

    /// Runs when the model stops without calling tools. Non-empty follow-ups
    /// are appended as user messages and the loop continues.
    async fn agent_stop(&self, _history: &History, _usage: &Usage) -> Vec<String> {
        Vec::new()
    }
}
