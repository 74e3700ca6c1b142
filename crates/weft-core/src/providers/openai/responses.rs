//! OpenAI Responses API provider.
//!
//! History is stored as a flat list of Responses items and replayed as
//! request input on every exchange (`store: false`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::chat_completions::{OpenAiConfig, is_reasoning_model};
use super::responses_sse::ResponsesSseParser;
use crate::providers::TurnRequest;
use crate::providers::retry::send_with_retry;
use crate::providers::shared::{ProviderResult, ProviderStream, USER_AGENT};
use crate::tools::ToolDefinition;

const RESPONSES_PATH: &str = "/responses";

// === Persisted items ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Message,
    FunctionCall,
    FunctionCallOutput,
    Reasoning,
}

/// One stored history item.
///
/// Message content is plain text; reasoning items keep their summary text in
/// `content` plus the opaque replay payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
    /// Image URLs (remote or `data:`) attached to a user message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl StoredItem {
    fn empty(item_type: ItemType) -> Self {
        Self {
            item_type,
            role: None,
            content: None,
            call_id: None,
            name: None,
            arguments: None,
            output: None,
            id: None,
            encrypted_content: None,
            images: Vec::new(),
        }
    }

    pub fn message(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: Some(role.to_string()),
            content: Some(text.into()),
            ..Self::empty(ItemType::Message)
        }
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            images,
            ..Self::message("user", text)
        }
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            call_id: Some(call_id.into()),
            name: Some(name.into()),
            arguments: Some(arguments.into()),
            ..Self::empty(ItemType::FunctionCall)
        }
    }

    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            ..Self::empty(ItemType::FunctionCallOutput)
        }
    }

    pub fn reasoning(
        summary: impl Into<String>,
        id: Option<String>,
        encrypted_content: Option<String>,
    ) -> Self {
        Self {
            content: Some(summary.into()),
            id,
            encrypted_content,
            ..Self::empty(ItemType::Reasoning)
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// An empty message (no text, no images); other item kinds are never empty.
    pub fn is_empty_message(&self) -> bool {
        self.item_type == ItemType::Message
            && self.text().trim().is_empty()
            && self.images.is_empty()
    }
}

// === Request types ===

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    stream: bool,
    store: bool,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    input: Vec<InputItem<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<FunctionTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningConfig<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    include: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct ReasoningConfig<'a> {
    effort: &'a str,
    summary: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem<'a> {
    Message {
        role: &'a str,
        content: Vec<InputContent<'a>>,
    },
    FunctionCall {
        call_id: &'a str,
        name: &'a str,
        arguments: &'a str,
    },
    FunctionCallOutput {
        call_id: &'a str,
        output: &'a str,
    },
    Reasoning {
        id: &'a str,
        encrypted_content: &'a str,
        summary: Vec<SummaryText<'a>>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputContent<'a> {
    InputText { text: &'a str },
    OutputText { text: &'a str },
    InputImage { image_url: &'a str },
}

#[derive(Debug, Serialize)]
struct SummaryText<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct FunctionTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDefinition> for FunctionTool {
    fn from(tool: &ToolDefinition) -> Self {
        let tool = tool.with_lowercase_name();
        Self {
            tool_type: "function",
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
        }
    }
}

/// Converts stored history into request input. Reasoning items without
/// replay data are display-only and skipped.
fn build_input(items: &[StoredItem]) -> Vec<InputItem<'_>> {
    items
        .iter()
        .filter_map(|item| match item.item_type {
            ItemType::Message => {
                let role = item.role.as_deref().unwrap_or("user");
                let text = item.text();
                let mut content = Vec::with_capacity(1 + item.images.len());
                if !text.is_empty() {
                    content.push(if role == "assistant" {
                        InputContent::OutputText { text }
                    } else {
                        InputContent::InputText { text }
                    });
                }
                content.extend(
                    item.images
                        .iter()
                        .map(|url| InputContent::InputImage { image_url: url }),
                );
                (!content.is_empty()).then_some(InputItem::Message { role, content })
            }
            ItemType::FunctionCall => Some(InputItem::FunctionCall {
                call_id: item.call_id.as_deref().unwrap_or(""),
                name: item.name.as_deref().unwrap_or(""),
                arguments: item.arguments.as_deref().unwrap_or("{}"),
            }),
            ItemType::FunctionCallOutput => Some(InputItem::FunctionCallOutput {
                call_id: item.call_id.as_deref().unwrap_or(""),
                output: item.output.as_deref().unwrap_or(""),
            }),
            ItemType::Reasoning => {
                let id = item.id.as_deref()?;
                let encrypted_content = item.encrypted_content.as_deref()?;
                let summary = match item.text() {
                    "" => Vec::new(),
                    text => vec![SummaryText {
                        kind: "summary_text",
                        text,
                    }],
                };
                Some(InputItem::Reasoning {
                    id,
                    encrypted_content,
                    summary,
                })
            }
        })
        .collect()
}

impl<'a> ResponsesRequest<'a> {
    fn new(items: &'a [StoredItem], request: &TurnRequest<'a>) -> Self {
        let reasoning = request
            .reasoning_effort
            .filter(|_| is_reasoning_model(request.model))
            .map(|effort| ReasoningConfig {
                effort,
                summary: "auto",
            });
        let include = if reasoning.is_some() {
            vec!["reasoning.encrypted_content"]
        } else {
            Vec::new()
        };

        Self {
            model: request.model,
            stream: true,
            store: false,
            max_output_tokens: request.max_tokens,
            instructions: Some(request.system).filter(|s| !s.trim().is_empty()),
            input: build_input(items),
            tools: request.tools.iter().map(FunctionTool::from).collect(),
            reasoning,
            include,
        }
    }
}

// === Client ===

#[derive(Debug, Clone)]
pub struct ResponsesClient {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl ResponsesClient {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Sends the stored items and returns an async stream of events.
    ///
    /// # Errors
    /// Returns a provider error if the request fails before streaming starts.
    pub async fn send_items_stream(
        &self,
        items: &[StoredItem],
        request: &TurnRequest<'_>,
    ) -> ProviderResult<ProviderStream> {
        let body = ResponsesRequest::new(items, request);
        let url = format!("{}{}", self.config.base_url, RESPONSES_PATH);

        let response = send_with_retry(&self.config.retry, || {
            self.http
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .header("accept", "text/event-stream")
                .header("content-type", "application/json")
                .header("user-agent", USER_AGENT)
                .json(&body)
        })
        .await?;

        Ok(Box::pin(ResponsesSseParser::new(
            response.bytes_stream(),
            request.model.to_string(),
        )))
    }
}
