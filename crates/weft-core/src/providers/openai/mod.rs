//! OpenAI providers: Chat Completions and Responses.

pub mod chat_completions;
pub mod responses;
mod responses_sse;

pub use chat_completions::{
    ChatCompletionsClient, ChatCompletionsSseParser, ChatContent, ChatContentPart, ChatMessage,
    ChatToolCall, DEFAULT_BASE_URL, ImageUrl, OpenAiConfig,
};
pub use responses::{ItemType, ResponsesClient, StoredItem};
pub use responses_sse::ResponsesSseParser;
