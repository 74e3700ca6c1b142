//! Provider-independent replay of stored conversations.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::ToolExecution;
use crate::core::history::History;
use crate::providers::ProviderKind;
use crate::providers::anthropic::{ContentBlock, Message};
use crate::providers::openai::{ChatMessage, ItemType, StoredItem};
use crate::tools::StructuredToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Text,
    ToolUse,
    ToolResult,
    Thinking,
}

/// One displayable fragment of a stored conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamableMessage {
    pub kind: MessageKind,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
    /// Tool arguments as a JSON string
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredToolResult>,
}

impl StreamableMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            role: role.to_string(),
            content: content.into(),
            tool_name: String::new(),
            tool_call_id: String::new(),
            input: String::new(),
            structured: None,
        }
    }

    fn thinking(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Thinking,
            ..Self::text("assistant", content)
        }
    }

    fn tool_use(call_id: &str, name: &str, input: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::ToolUse,
            tool_name: name.to_string(),
            tool_call_id: call_id.to_string(),
            input: input.into(),
            ..Self::text("assistant", String::new())
        }
    }
}

/// Builds tool-result fragments, attributed to the assistant. When a
/// structured result exists it replaces the raw text.
struct Extractor<'a> {
    tool_results: &'a BTreeMap<String, StructuredToolResult>,
    tool_names: HashMap<String, String>,
    out: Vec<StreamableMessage>,
}

impl<'a> Extractor<'a> {
    fn new(tool_results: &'a BTreeMap<String, StructuredToolResult>) -> Self {
        Self {
            tool_results,
            tool_names: HashMap::new(),
            out: Vec::new(),
        }
    }

    fn text(&mut self, role: &str, text: &str) {
        if role == "system" || role == "developer" || text.trim().is_empty() {
            return;
        }
        self.out.push(StreamableMessage::text(role, text));
    }

    fn thinking(&mut self, text: &str) {
        if !text.trim().is_empty() {
            self.out.push(StreamableMessage::thinking(text));
        }
    }

    fn tool_use(&mut self, call_id: &str, name: &str, input: String) {
        self.tool_names.insert(call_id.to_string(), name.to_string());
        self.out.push(StreamableMessage::tool_use(call_id, name, input));
    }

    fn tool_result(&mut self, call_id: &str, raw: &str) {
        let structured = self.tool_results.get(call_id).cloned();
        let tool_name = structured
            .as_ref()
            .map(|s| s.tool_name.clone())
            .or_else(|| self.tool_names.get(call_id).cloned())
            .unwrap_or_default();
        let content = structured
            .as_ref()
            .and_then(|s| serde_json::to_string(s).ok())
            .unwrap_or_else(|| raw.to_string());
        self.out.push(StreamableMessage {
            kind: MessageKind::ToolResult,
            tool_name,
            tool_call_id: call_id.to_string(),
            structured,
            ..StreamableMessage::text("assistant", content)
        });
    }

    fn anthropic(&mut self, messages: &[Message]) {
        for message in messages {
            for block in &message.content {
                match block {
                    ContentBlock::Text { text, .. } => self.text(&message.role, text),
                    ContentBlock::Thinking { thinking, .. } => self.thinking(thinking),
                    ContentBlock::ToolUse { id, name, input } => {
                        self.tool_use(id, name, input.to_string());
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => self.tool_result(tool_use_id, content),
                    ContentBlock::Image { .. } | ContentBlock::RedactedThinking { .. } => {}
                }
            }
        }
    }

    fn chat(&mut self, messages: &[ChatMessage]) {
        for message in messages {
            if message.role == "tool" {
                let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                self.tool_result(call_id, &message.text());
                continue;
            }
            if let Some(reasoning) = &message.reasoning_content {
                self.thinking(reasoning);
            }
            self.text(&message.role, &message.text());
            for call in &message.tool_calls {
                self.tool_use(&call.id, &call.function.name, call.function.arguments.clone());
            }
        }
    }

    fn responses(&mut self, items: &[StoredItem]) {
        for item in items {
            let call_id = item.call_id.as_deref().unwrap_or_default();
            match item.item_type {
                ItemType::Message => {
                    self.text(item.role.as_deref().unwrap_or("assistant"), item.text());
                }
                ItemType::Reasoning => self.thinking(item.text()),
                ItemType::FunctionCall => self.tool_use(
                    call_id,
                    item.name.as_deref().unwrap_or_default(),
                    item.arguments.clone().unwrap_or_default(),
                ),
                ItemType::FunctionCallOutput => {
                    self.tool_result(call_id, item.output.as_deref().unwrap_or_default());
                }
            }
        }
    }
}

/// Decodes a record's `rawMessages` into display fragments. System messages
/// are skipped.
///
/// # Errors
/// Returns an error if `raw` does not match the provider's message format.
pub fn extract_messages(
    provider: ProviderKind,
    raw: &Value,
    tool_results: &BTreeMap<String, StructuredToolResult>,
) -> Result<Vec<StreamableMessage>> {
    let history = History::from_json(provider, raw)
        .with_context(|| format!("Failed to decode {provider} messages"))?;
    let mut extractor = Extractor::new(tool_results);
    match &history {
        History::Anthropic(messages) => extractor.anthropic(messages),
        History::OpenAiChat(messages) => extractor.chat(messages),
        History::OpenAiResponses(items) => extractor.responses(items),
    }
    Ok(extractor.out)
}

/// Appends `pending` executions after the stored ones for each message
/// index. Entries already stored are not duplicated and nothing stored is
/// dropped.
pub fn merge_tool_executions(
    stored: &mut BTreeMap<usize, Vec<ToolExecution>>,
    pending: &BTreeMap<usize, Vec<ToolExecution>>,
) {
    for (index, executions) in pending {
        let entry = stored.entry(*index).or_default();
        for execution in executions {
            if !entry.contains(execution) {
                entry.push(execution.clone());
            }
        }
    }
}
