//! Conversation persistence: records, storage and replay.

pub mod codec;
pub mod record;
pub mod store;

pub use codec::{MessageKind, StreamableMessage, extract_messages, merge_tool_executions};
pub use record::{ConversationRecord, ConversationSummary, ToolExecution, generate_id};
pub use store::{
    ConversationStore, JsonConversationStore, QueryOptions, QueryResult, SortBy, SortOrder,
};
