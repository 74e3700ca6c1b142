//! Structured tool results.
//!
//! Stored per call ID alongside a conversation so replay can show rich tool
//! output instead of the raw string the model saw. The JSON shape is
//! `{toolName, success, error?, metadataType?, metadata?, timestamp}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStructuredResult", into = "RawStructuredResult")]
pub struct StructuredToolResult {
    pub tool_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: Option<ToolMetadata>,
    pub timestamp: DateTime<Utc>,
}

impl StructuredToolResult {
    pub fn success(tool_name: impl Into<String>, metadata: Option<ToolMetadata>) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: true,
            error: None,
            metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            error: Some(error.into()),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Failed result for a call a hook refused to run.
    pub fn blocked(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let tool_name = tool_name.into();
        let reason = reason.into();
        Self {
            error: Some(format!("blocked by hook: {reason}")),
            metadata: Some(ToolMetadata::Blocked(BlockedMetadata {
                tool_name: tool_name.clone(),
                reason,
            })),
            ..Self::failure(tool_name, "")
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: ToolMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Tool-specific metadata, tagged on disk by `metadataType`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolMetadata {
    Bash(BashMetadata),
    FileRead(FileReadMetadata),
    FileWrite(FileWriteMetadata),
    FileEdit(FileEditMetadata),
    Grep(GrepMetadata),
    Glob(GlobMetadata),
    WebFetch(WebFetchMetadata),
    SubAgent(SubAgentMetadata),
    McpTool(McpToolMetadata),
    Thinking(ThinkingMetadata),
    Blocked(BlockedMetadata),
}

impl ToolMetadata {
    pub fn type_name(&self) -> &'static str {
        match self {
            ToolMetadata::Bash(_) => "bash",
            ToolMetadata::FileRead(_) => "file_read",
            ToolMetadata::FileWrite(_) => "file_write",
            ToolMetadata::FileEdit(_) => "file_edit",
            ToolMetadata::Grep(_) => "grep_tool",
            ToolMetadata::Glob(_) => "glob_tool",
            ToolMetadata::WebFetch(_) => "web_fetch",
            ToolMetadata::SubAgent(_) => "subagent",
            ToolMetadata::McpTool(_) => "mcp_tool",
            ToolMetadata::Thinking(_) => "thinking",
            ToolMetadata::Blocked(_) => "blocked",
        }
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            ToolMetadata::Bash(m) => serde_json::to_value(m),
            ToolMetadata::FileRead(m) => serde_json::to_value(m),
            ToolMetadata::FileWrite(m) => serde_json::to_value(m),
            ToolMetadata::FileEdit(m) => serde_json::to_value(m),
            ToolMetadata::Grep(m) => serde_json::to_value(m),
            ToolMetadata::Glob(m) => serde_json::to_value(m),
            ToolMetadata::WebFetch(m) => serde_json::to_value(m),
            ToolMetadata::SubAgent(m) => serde_json::to_value(m),
            ToolMetadata::McpTool(m) => serde_json::to_value(m),
            ToolMetadata::Thinking(m) => serde_json::to_value(m),
            ToolMetadata::Blocked(m) => serde_json::to_value(m),
        }
    }

    /// Returns `Ok(None)` for metadata types this build does not know.
    fn from_value(type_name: &str, value: Value) -> serde_json::Result<Option<Self>> {
        let metadata = match type_name {
            "bash" => ToolMetadata::Bash(serde_json::from_value(value)?),
            "file_read" => ToolMetadata::FileRead(serde_json::from_value(value)?),
            "file_write" => ToolMetadata::FileWrite(serde_json::from_value(value)?),
            "file_edit" => ToolMetadata::FileEdit(serde_json::from_value(value)?),
            "grep_tool" => ToolMetadata::Grep(serde_json::from_value(value)?),
            "glob_tool" => ToolMetadata::Glob(serde_json::from_value(value)?),
            "web_fetch" => ToolMetadata::WebFetch(serde_json::from_value(value)?),
            "subagent" => ToolMetadata::SubAgent(serde_json::from_value(value)?),
            "mcp_tool" => ToolMetadata::McpTool(serde_json::from_value(value)?),
            "thinking" => ToolMetadata::Thinking(serde_json::from_value(value)?),
            "blocked" => ToolMetadata::Blocked(serde_json::from_value(value)?),
            _ => return Ok(None),
        };
        Ok(Some(metadata))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStructuredResult {
    tool_name: String,
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawStructuredResult> for StructuredToolResult {
    type Error = String;

    fn try_from(raw: RawStructuredResult) -> Result<Self, Self::Error> {
        let metadata = match (raw.metadata_type, raw.metadata) {
            (Some(type_name), Some(value)) if !value.is_null() => {
                ToolMetadata::from_value(&type_name, value)
                    .map_err(|e| format!("failed to decode {type_name} metadata: {e}"))?
            }
            _ => None,
        };
        Ok(Self {
            tool_name: raw.tool_name,
            success: raw.success,
            error: raw.error.filter(|e| !e.is_empty()),
            metadata,
            timestamp: raw.timestamp,
        })
    }
}

impl From<StructuredToolResult> for RawStructuredResult {
    fn from(result: StructuredToolResult) -> Self {
        // Metadata structs are plain data; encoding them cannot fail.
        let (metadata_type, metadata) = match &result.metadata {
            Some(m) => (Some(m.type_name().to_string()), m.to_value().ok()),
            None => (None, None),
        };
        Self {
            tool_name: result.tool_name,
            success: result.success,
            error: result.error,
            metadata_type,
            metadata,
            timestamp: result.timestamp,
        }
    }
}

// === Metadata payloads ===

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BashMetadata {
    pub command: String,
    pub exit_code: i32,
    pub output: String,
    /// Nanoseconds
    pub execution_time: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileReadMetadata {
    pub file_path: String,
    pub offset: usize,
    pub lines: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub language: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileWriteMetadata {
    pub file_path: String,
    pub content: String,
    pub size: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub language: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileEditMetadata {
    pub file_path: String,
    pub edits: Vec<Edit>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub language: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Edit {
    pub start_line: usize,
    pub end_line: usize,
    pub old_content: String,
    pub new_content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrepMetadata {
    pub pattern: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub include: String,
    pub results: Vec<SearchResult>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchResult {
    pub file_path: String,
    pub matches: Vec<SearchMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchMatch {
    pub line_number: usize,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobMetadata {
    pub pattern: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub files: Vec<FileInfo>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    /// "file" or "directory"
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebFetchMetadata {
    pub url: String,
    pub content_type: String,
    pub size: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub saved_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    pub processed_type: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubAgentMetadata {
    pub question: String,
    pub model_strength: String,
    pub response: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct McpToolMetadata {
    pub mcp_tool_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    pub content_text: String,
    /// Nanoseconds
    pub execution_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThinkingMetadata {
    pub thought: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub category: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockedMetadata {
    pub tool_name: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_metadata_type_tag_round_trips() {
        let result = StructuredToolResult::success(
            "bash",
            Some(ToolMetadata::Bash(BashMetadata {
                command: "echo hi".into(),
                exit_code: 0,
                output: "hi\n".into(),
                execution_time: 1_500_000,
                working_dir: String::new(),
            })),
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["toolName"], "bash");
        assert_eq!(value["metadataType"], "bash");
        assert_eq!(value["metadata"]["exitCode"], 0);
        assert!(value.get("error").is_none());
        assert!(value["metadata"].get("workingDir").is_none());

        let back: StructuredToolResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_unknown_metadata_type_is_dropped() {
        let result: StructuredToolResult = serde_json::from_value(json!({
            "toolName": "browser_click",
            "success": true,
            "timestamp": "2023-01-01T00:00:00Z",
            "metadataType": "browser_click",
            "metadata": {"elementId": 3}
        }))
        .unwrap();
        assert!(result.success);
        assert!(result.metadata.is_none());
    }

    #[test]
    fn test_legacy_record_without_metadata() {
        let result: StructuredToolResult = serde_json::from_value(json!({
            "toolName": "file_read",
            "success": false,
            "error": "no such file",
            "timestamp": "2023-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(result.error.as_deref(), Some("no such file"));
        assert!(result.metadata.is_none());
    }

    #[test]
    fn test_mismatched_metadata_is_an_error() {
        let err = serde_json::from_value::<StructuredToolResult>(json!({
            "toolName": "file_read",
            "success": true,
            "metadataType": "file_read",
            "metadata": {"lines": "not a list"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("file_read metadata"));
    }

    #[test]
    fn test_blocked_result() {
        let result = StructuredToolResult::blocked("bash", "rm is not allowed");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("blocked by hook: rm is not allowed"));
        assert_eq!(
            serde_json::to_value(&result).unwrap()["metadata"],
            json!({"tool_name": "bash", "reason": "rm is not allowed"})
        );
    }
}
