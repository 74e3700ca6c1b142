//! Persisted conversation record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::usage::Usage;
use crate::tools::StructuredToolResult;

/// First-message previews longer than this are truncated.
const FIRST_MESSAGE_MAX_CHARS: usize = 100;

/// One tool call recorded against the assistant message that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    /// Raw argument JSON after hooks
    pub input: String,
    #[serde(default)]
    pub user_facing: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub model: String,
    /// Provider-native message list
    #[serde(default)]
    pub raw_messages: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_results: BTreeMap<String, StructuredToolResult>,
    /// Keyed by message index; serialized with string keys
    #[serde(default)]
    pub tool_executions_by_message: BTreeMap<usize, Vec<ToolExecution>>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ConversationRecord {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            provider: provider.into(),
            model: String::new(),
            raw_messages: Value::Array(Vec::new()),
            tool_results: BTreeMap::new(),
            tool_executions_by_message: BTreeMap::new(),
            usage: Usage::default(),
            summary: String::new(),
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    pub fn message_count(&self) -> usize {
        self.raw_messages.as_array().map_or(0, Vec::len)
    }

    /// Text of the first user message, whichever backend wrote it.
    pub fn first_user_message(&self) -> Option<String> {
        self.raw_messages
            .as_array()?
            .iter()
            .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .find_map(|m| match m.get("content")? {
                Value::String(text) => Some(text.clone()),
                Value::Array(parts) => parts
                    .iter()
                    .find_map(|p| p.get("text").and_then(Value::as_str))
                    .map(str::to_string),
                _ => None,
            })
    }

    pub fn to_summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            message_count: self.message_count(),
            first_message: self
                .first_user_message()
                .map(|m| truncate_preview(&m))
                .unwrap_or_default(),
            summary: self.summary.clone(),
            provider: self.provider.clone(),
            usage: self.usage,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing entry for a stored conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub message_count: usize,
    pub first_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    pub provider: String,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn truncate_preview(text: &str) -> String {
    if text.chars().count() > FIRST_MESSAGE_MAX_CHARS {
        let head: String = text.chars().take(FIRST_MESSAGE_MAX_CHARS - 3).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// New conversation id: UTC timestamp plus 16 random hex digits.
pub fn generate_id() -> String {
    let random = uuid::Uuid::new_v4();
    let suffix: String = random.as_bytes()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("{}-{suffix}", Utc::now().format("%Y%m%dT%H%M%S"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        let (stamp, suffix) = id.split_once('-').unwrap();
        assert_eq!(stamp.len(), 15);
        assert_eq!(&stamp[8..9], "T");
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_id(), id);
    }

    #[test]
    fn test_tool_executions_keys_serialize_as_strings() {
        let mut record = ConversationRecord::new("c1", "anthropic");
        record.tool_executions_by_message.insert(
            3,
            vec![ToolExecution {
                tool_name: "bash".to_string(),
                call_id: String::new(),
                input: "{}".to_string(),
                user_facing: "ok".to_string(),
            }],
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["toolExecutionsByMessage"]["3"][0]["toolName"], "bash");
        assert!(json["toolExecutionsByMessage"]["3"][0].get("callId").is_none());

        let back: ConversationRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_summary_first_message_per_format() {
        let mut record = ConversationRecord::new("c1", "anthropic");
        record.raw_messages = json!([
            {"role": "user", "content": [{"type": "text", "text": "hello there"}]},
            {"role": "assistant", "content": [{"type": "text", "text": "hi"}]}
        ]);
        let summary = record.to_summary();
        assert_eq!(summary.first_message, "hello there");
        assert_eq!(summary.message_count, 2);

        record.raw_messages = json!([
            {"type": "message", "role": "user", "content": "from responses"}
        ]);
        assert_eq!(record.to_summary().first_message, "from responses");
    }

    #[test]
    fn test_long_first_message_is_truncated() {
        let mut record = ConversationRecord::new("c1", "openai");
        record.raw_messages = json!([{"role": "user", "content": "x".repeat(150)}]);
        let first = record.to_summary().first_message;
        assert_eq!(first.len(), 100);
        assert!(first.ends_with("..."));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let record: ConversationRecord = serde_json::from_value(json!({
            "id": "c1",
            "provider": "openai",
            "createdAt": "2025-01-01T00:00:00Z",
            "updatedAt": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(record.tool_executions_by_message.is_empty());
        assert_eq!(record.message_count(), 0);
        assert!(record.summary.is_empty());
    }
}
