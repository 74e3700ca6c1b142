//! Provider-tagged message buffer.
//!
//! Each variant holds the native message list of one backend protocol. Only
//! the client and codec of that backend read the inner messages; the thread
//! works through the methods here.

use serde_json::Value;
use tracing::debug;

use super::dispatch::ToolCallOutcome;
use super::turn::{AssistantTurn, ToolCall, TurnBlock};
use crate::images::ImageAttachment;
use crate::providers::ProviderKind;
use crate::providers::anthropic::{CacheControl, ContentBlock, ImageSource, Message};
use crate::providers::openai::{
    ChatContent, ChatContentPart, ChatMessage, ChatToolCall, ImageUrl, ItemType, StoredItem,
};

#[derive(Debug, Clone, PartialEq)]
pub enum History {
    Anthropic(Vec<Message>),
    OpenAiChat(Vec<ChatMessage>),
    OpenAiResponses(Vec<StoredItem>),
}

impl History {
    pub fn new(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Anthropic => History::Anthropic(Vec::new()),
            ProviderKind::OpenAiChat => History::OpenAiChat(Vec::new()),
            ProviderKind::OpenAiResponses => History::OpenAiResponses(Vec::new()),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            History::Anthropic(_) => ProviderKind::Anthropic,
            History::OpenAiChat(_) => ProviderKind::OpenAiChat,
            History::OpenAiResponses(_) => ProviderKind::OpenAiResponses,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            History::Anthropic(m) => m.len(),
            History::OpenAiChat(m) => m.len(),
            History::OpenAiResponses(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push_user(&mut self, text: &str, images: &[ImageAttachment]) {
        match self {
            History::Anthropic(messages) => {
                let mut content = vec![ContentBlock::text(text)];
                content.extend(images.iter().map(|image| ContentBlock::Image {
                    source: match image {
                        ImageAttachment::Url(url) => ImageSource::Url { url: url.clone() },
                        ImageAttachment::Base64 { media_type, data } => ImageSource::Base64 {
                            media_type: media_type.clone(),
                            data: data.clone(),
                        },
                    },
                }));
                messages.push(Message::user(content));
            }
            History::OpenAiChat(messages) => {
                let content = if images.is_empty() {
                    ChatContent::Text(text.to_string())
                } else {
                    let mut parts = vec![ChatContentPart::Text {
                        text: text.to_string(),
                    }];
                    parts.extend(images.iter().map(|image| ChatContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image.to_url(),
                            detail: Some("auto".to_string()),
                        },
                    }));
                    ChatContent::Parts(parts)
                };
                messages.push(ChatMessage::user(content));
            }
            History::OpenAiResponses(items) => {
                let urls = images.iter().map(ImageAttachment::to_url).collect();
                items.push(StoredItem::user_with_images(text, urls));
            }
        }
    }

    /// Appends the assistant side of an exchange. Returns the index of the
    /// last entry written, or `None` when the turn had no content.
    pub fn push_assistant(&mut self, turn: &AssistantTurn) -> Option<usize> {
        if turn.is_empty() {
            return None;
        }
        match self {
            History::Anthropic(messages) => {
                let content = turn
                    .blocks
                    .iter()
                    .filter_map(|block| match block {
                        // Unsigned thinking cannot be replayed
                        TurnBlock::Thinking(t) => (!t.signature.is_empty()).then(|| {
                            ContentBlock::Thinking {
                                thinking: t.text.clone(),
                                signature: t.signature.clone(),
                            }
                        }),
                        TurnBlock::Text(text) => Some(ContentBlock::text(text.clone())),
                        TurnBlock::ToolCall(call) => Some(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.input.clone(),
                        }),
                    })
                    .collect();
                messages.push(Message::assistant(content));
            }
            History::OpenAiChat(messages) => {
                let text = turn.text();
                let reasoning: String = turn
                    .blocks
                    .iter()
                    .filter_map(|b| match b {
                        TurnBlock::Thinking(t) => Some(t.text.as_str()),
                        _ => None,
                    })
                    .collect();
                let tool_calls = turn
                    .tool_calls()
                    .map(|call| ChatToolCall::new(&call.id, &call.name, replay_arguments(call)))
                    .collect();
                messages.push(ChatMessage::assistant(
                    (!text.is_empty()).then_some(text),
                    (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls,
                ));
            }
            History::OpenAiResponses(items) => {
                for block in &turn.blocks {
                    items.push(match block {
                        TurnBlock::Thinking(t) => StoredItem::reasoning(
                            t.text.clone(),
                            t.replay_id.clone(),
                            t.encrypted_content.clone(),
                        ),
                        TurnBlock::Text(text) => StoredItem::message("assistant", text.clone()),
                        TurnBlock::ToolCall(call) => {
                            StoredItem::function_call(&call.id, &call.name, replay_arguments(call))
                        }
                    });
                }
            }
        }
        Some(self.len() - 1)
    }

    /// Appends tool results in call order.
    pub fn push_tool_results(&mut self, outcomes: &[ToolCallOutcome]) {
        if outcomes.is_empty() {
            return;
        }
        match self {
            History::Anthropic(messages) => {
                let content = outcomes
                    .iter()
                    .map(|o| ContentBlock::ToolResult {
                        tool_use_id: o.call_id.clone(),
                        content: o.output.content.clone(),
                        is_error: !o.output.is_success(),
                    })
                    .collect();
                messages.push(Message::user(content));
            }
            History::OpenAiChat(messages) => {
                messages.extend(
                    outcomes
                        .iter()
                        .map(|o| ChatMessage::tool_result(&o.call_id, &o.output.content)),
                );
            }
            History::OpenAiResponses(items) => {
                items.extend(
                    outcomes
                        .iter()
                        .map(|o| StoredItem::function_call_output(&o.call_id, &o.output.content)),
                );
            }
        }
    }

    /// Drops trailing entries that would make the history unreplayable:
    /// empty messages and tool calls with no result after them. Returns how
    /// many entries were removed.
    pub fn repair(&mut self) -> usize {
        let before = self.len();
        match self {
            History::Anthropic(messages) => {
                while let Some(last) = messages.last() {
                    if last.is_empty() || (last.role == "assistant" && last.has_tool_use()) {
                        messages.pop();
                    } else {
                        break;
                    }
                }
            }
            History::OpenAiChat(messages) => {
                while let Some(last) = messages.last() {
                    if last.is_empty() || !last.tool_calls.is_empty() {
                        messages.pop();
                    } else {
                        break;
                    }
                }
            }
            History::OpenAiResponses(items) => {
                // A reasoning item must be followed by the item it produced
                while let Some(last) = items.last() {
                    if last.is_empty_message()
                        || matches!(last.item_type, ItemType::FunctionCall | ItemType::Reasoning)
                    {
                        items.pop();
                    } else {
                        break;
                    }
                }
            }
        }
        let removed = before - self.len();
        if removed > 0 {
            debug!(removed, "removed trailing incomplete messages");
        }
        removed
    }

    /// Moves the Anthropic prompt-cache breakpoint to the last text block.
    /// Other backends cache automatically.
    pub fn mark_cache_breakpoint(&mut self) {
        let History::Anthropic(messages) = self else {
            return;
        };
        for message in messages.iter_mut() {
            for block in &mut message.content {
                if let ContentBlock::Text { cache_control, .. } = block {
                    *cache_control = None;
                }
            }
        }
        let last_text = messages
            .iter_mut()
            .rev()
            .flat_map(|m| m.content.iter_mut().rev())
            .find(|b| matches!(b, ContentBlock::Text { .. }));
        if let Some(ContentBlock::Text { cache_control, .. }) = last_text {
            *cache_control = Some(CacheControl::ephemeral());
        }
    }

    /// Native JSON encoding, stored as a record's `rawMessages`.
    ///
    /// # Errors
    /// Returns an error if a message fails to serialize.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        match self {
            History::Anthropic(m) => serde_json::to_value(m),
            History::OpenAiChat(m) => serde_json::to_value(m),
            History::OpenAiResponses(m) => serde_json::to_value(m),
        }
    }

    /// Decodes `rawMessages` for the given backend. `null` is an empty history.
    ///
    /// # Errors
    /// Returns an error if the JSON does not match the backend's format.
    pub fn from_json(kind: ProviderKind, raw: &Value) -> serde_json::Result<Self> {
        if raw.is_null() {
            return Ok(Self::new(kind));
        }
        Ok(match kind {
            ProviderKind::Anthropic => History::Anthropic(serde_json::from_value(raw.clone())?),
            ProviderKind::OpenAiChat => History::OpenAiChat(serde_json::from_value(raw.clone())?),
            ProviderKind::OpenAiResponses => {
                History::OpenAiResponses(serde_json::from_value(raw.clone())?)
            }
        })
    }

    /// Text of the first user message, used for listings.
    pub fn first_user_text(&self) -> Option<String> {
        let text = match self {
            History::Anthropic(m) => m.iter().find(|m| m.role == "user").map(Message::text),
            History::OpenAiChat(m) => m.iter().find(|m| m.role == "user").map(ChatMessage::text),
            History::OpenAiResponses(items) => items
                .iter()
                .find(|i| i.item_type == ItemType::Message && i.role.as_deref() == Some("user"))
                .map(|i| i.text().to_string()),
        }?;
        (!text.trim().is_empty()).then_some(text)
    }
}

/// Malformed arguments are replayed as the wrapper object so the backend
/// always receives valid JSON.
fn replay_arguments(call: &ToolCall) -> String {
    if call.parse_error.is_some() {
        call.input.to_string()
    } else {
        call.arguments.clone()
    }
}
