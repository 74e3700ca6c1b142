//! Anthropic Messages API provider.
//!
//! The persisted history for Anthropic threads is the Messages API message
//! list itself (`types::Message`), so it can be replayed without conversion.

mod client;
mod sse;
pub mod types;

pub use client::{AnthropicClient, AnthropicConfig, DEFAULT_BASE_URL};
pub use sse::SseParser;
pub use types::{CacheControl, ContentBlock, ImageSource, Message};
