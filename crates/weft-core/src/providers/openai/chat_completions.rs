//! OpenAI Chat Completions provider.
//!
//! History is persisted as Chat Completions messages (without the system
//! prompt, which is prepended per request).

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Result;
use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RetryConfig;
use crate::providers::retry::send_with_retry;
use crate::providers::shared::{
    ContentBlockType, ProviderError, ProviderResult, ProviderStream, StreamEvent, TokenUsage,
    USER_AGENT, classify_stream_error, resolve_api_key, resolve_base_url,
};
use crate::providers::TurnRequest;
use crate::tools::ToolDefinition;

/// Default base URL for the OpenAI API.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

// === Persisted message types ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ChatContent>,
    /// Reasoning text kept for display and replay; never sent upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: ChatContent) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content),
            reasoning_content: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(
        text: Option<String>,
        reasoning: Option<String>,
        tool_calls: Vec<ChatToolCall>,
    ) -> Self {
        Self {
            role: "assistant".to_string(),
            content: text.map(ChatContent::Text),
            reasoning_content: reasoning,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(ChatContent::Text(output.into())),
            reasoning_content: None,
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Concatenated text content.
    pub fn text(&self) -> String {
        match &self.content {
            Some(ChatContent::Text(text)) => text.clone(),
            Some(ChatContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ChatContentPart::Text { text } => Some(text.as_str()),
                    ChatContentPart::ImageUrl { .. } => None,
                })
                .collect(),
            None => String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let has_image = matches!(&self.content, Some(ChatContent::Parts(parts))
            if parts.iter().any(|p| matches!(p, ChatContentPart::ImageUrl { .. })));
        self.text().trim().is_empty() && self.tool_calls.is_empty() && !has_image
    }
}

/// Message content - either a simple string or an array of content parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContentPart {
    Text { text: String },
    /// Accepts both remote URLs and base64 data URLs
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: ChatFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

impl ChatToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tool_type: function_type(),
            function: ChatFunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFunctionCall {
    pub name: String,
    pub arguments: String,
}

// === Client ===

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub retry: RetryConfig,
}

impl OpenAiConfig {
    /// Resolves credentials from config and environment.
    ///
    /// # Errors
    /// Returns an error if no API key is available or the base URL is invalid.
    pub fn from_env(
        config_api_key: Option<&str>,
        config_base_url: Option<&str>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let api_key = resolve_api_key(config_api_key, "OPENAI_API_KEY", "openai")?;
        let base_url =
            resolve_base_url(config_base_url, "OPENAI_BASE_URL", DEFAULT_BASE_URL, "OpenAI")?;
        Ok(Self {
            api_key,
            base_url,
            retry,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl ChatCompletionsClient {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Sends the conversation and returns an async stream of events.
    ///
    /// # Errors
    /// Returns a provider error if the request fails before streaming starts.
    pub async fn send_messages_stream(
        &self,
        messages: &[ChatMessage],
        request: &TurnRequest<'_>,
    ) -> ProviderResult<ProviderStream> {
        let body = ChatCompletionRequest::new(messages, request);
        let url = format!("{}{}", self.config.base_url, CHAT_COMPLETIONS_PATH);

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

        Ok(Box::pin(ChatCompletionsSseParser::new(
            response.bytes_stream(),
            request.model.to_string(),
        )))
    }
}

/// Reasoning models accept `reasoning_effort`; others reject it.
pub(crate) fn is_reasoning_model(model: &str) -> bool {
    let lower = model.to_lowercase();
    ["o1", "o3", "o4", "gpt-5", "codex"]
        .iter()
        .any(|p| lower.starts_with(p))
}

// === Request types ===

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatToolDefinition>>,
    max_completion_tokens: u32,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// A history message as sent upstream (no reasoning text).
#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<WireContent<'a>>,
    #[serde(skip_serializing_if = "<[ChatToolCall]>::is_empty")]
    tool_calls: &'a [ChatToolCall],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Borrowed(&'a ChatContent),
    Owned(String),
}

#[derive(Debug, Serialize)]
struct ChatToolDefinition {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatToolFunction,
}

#[derive(Debug, Serialize)]
struct ChatToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDefinition> for ChatToolDefinition {
    fn from(tool: &ToolDefinition) -> Self {
        let tool = tool.with_lowercase_name();
        Self {
            tool_type: "function",
            function: ChatToolFunction {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
            },
        }
    }
}

impl<'a> ChatCompletionRequest<'a> {
    fn new(messages: &'a [ChatMessage], request: &TurnRequest<'a>) -> Self {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if !request.system.trim().is_empty() {
            wire.push(WireMessage {
                role: "system",
                content: Some(WireContent::Owned(request.system.to_string())),
                tool_calls: &[],
                tool_call_id: None,
            });
        }
        wire.extend(messages.iter().map(|m| WireMessage {
            role: &m.role,
            content: m.content.as_ref().map(WireContent::Borrowed),
            tool_calls: &m.tool_calls,
            tool_call_id: m.tool_call_id.as_deref(),
        }));

        let tools = (!request.tools.is_empty())
            .then(|| request.tools.iter().map(ChatToolDefinition::from).collect());

        Self {
            model: request.model,
            stream: true,
            messages: wire,
            tools,
            max_completion_tokens: request.max_tokens,
            stream_options: StreamOptions {
                include_usage: true,
            },
            reasoning_effort: request
                .reasoning_effort
                .filter(|_| is_reasoning_model(request.model)),
        }
    }
}

// === Stream normalizer ===

/// Appends a blank line at end of input so a final event without a trailing
/// delimiter is still dispatched.
pub(crate) struct SseTerminatedStream<S> {
    inner: S,
    emitted_terminator: bool,
}

impl<S> SseTerminatedStream<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            emitted_terminator: false,
        }
    }
}

impl<S, E> Stream for SseTerminatedStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
{
    type Item = std::result::Result<bytes::Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.emitted_terminator {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(None) => {
                self.emitted_terminator = true;
                Poll::Ready(Some(Ok(bytes::Bytes::from_static(b"\n\n"))))
            }
            other => other,
        }
    }
}

/// Converts chat-completion chunks into `StreamEvent`s.
///
/// Chunks carry no block boundaries, so text, reasoning and each tool call
/// (keyed by the chunk's `index`) get a synthetic block index of their own.
pub struct ChatCompletionsSseParser<S> {
    inner: EventStream<SseTerminatedStream<S>>,
    model: String,
    pending: VecDeque<StreamEvent>,
    next_index: usize,
    text_index: Option<usize>,
    reasoning_index: Option<usize>,
    tool_calls: BTreeMap<u64, usize>,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    saw_done_marker: bool,
    started: bool,
    done: bool,
}

impl<S> ChatCompletionsSseParser<S> {
    pub fn new<E>(stream: S, model: String) -> Self
    where
        S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    {
        Self {
            inner: SseTerminatedStream::new(stream).eventsource(),
            model,
            pending: VecDeque::new(),
            next_index: 0,
            text_index: None,
            reasoning_index: None,
            tool_calls: BTreeMap::new(),
            usage: None,
            finish_reason: None,
            saw_done_marker: false,
            started: false,
            done: false,
        }
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Emits the closing events once. At end of input a stream that sent a
    /// finish reason or `[DONE]` completes even without a usage chunk; one
    /// that sent neither was cut off and ends without completion.
    fn finish(&mut self, at_eof: bool) {
        if self.done {
            return;
        }
        let reason = match &self.finish_reason {
            Some(reason) => reason.clone(),
            None if at_eof && self.saw_done_marker => "stop".to_string(),
            None => return,
        };
        self.done = true;

        let open = [self.reasoning_index.take(), self.text_index.take()];
        for index in open.into_iter().flatten() {
            self.pending
                .push_back(StreamEvent::ContentBlockCompleted { index });
        }
        for index in std::mem::take(&mut self.tool_calls).into_values() {
            self.pending
                .push_back(StreamEvent::ContentBlockCompleted { index });
        }

        let stop_reason = if self.next_index > 0 && reason == "tool_calls" {
            "tool_use".to_string()
        } else {
            map_finish_reason(&reason)
        };
        self.pending.push_back(StreamEvent::MessageDelta {
            stop_reason: Some(stop_reason),
            usage: self.usage,
        });
        self.pending.push_back(StreamEvent::MessageCompleted);
    }

    fn handle_data(&mut self, data: &str) -> ProviderResult<()> {
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            self.saw_done_marker = true;
            return Ok(());
        }
        if trimmed.is_empty() {
            return Ok(());
        }
        let value: Value = serde_json::from_str(trimmed).map_err(|err| {
            ProviderError::parse(format!("Failed to parse chunk JSON: {err}")).with_details(trimmed)
        })?;
        self.handle_chunk(&value);
        Ok(())
    }

    fn handle_chunk(&mut self, value: &Value) {
        if let Some(error) = value.get("error") {
            let error_type = error
                .get("type")
                .or_else(|| error.get("code"))
                .and_then(Value::as_str)
                .unwrap_or("error")
                .to_string();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            self.pending.push_back(StreamEvent::Error {
                error_type,
                message,
            });
            self.done = true;
            return;
        }

        if !self.started {
            self.started = true;
            self.pending.push_back(StreamEvent::MessageStart {
                model: value
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.model)
                    .to_string(),
                usage: TokenUsage::default(),
            });
        }

        let choice = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first());
        if let Some(choice) = choice {
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(reason.to_string());
            }
            if let Some(delta) = choice.get("delta") {
                self.handle_delta(delta);
            }
        }

        if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(parse_usage(usage));
        }

        // With include_usage the usage chunk follows the finish_reason chunk.
        if self.finish_reason.is_some() && self.usage.is_some() {
            self.finish(false);
        }
    }

    fn handle_delta(&mut self, delta: &Value) {
        if let Some(reasoning) = delta
            .get("reasoning_content")
            .or_else(|| delta.get("reasoning"))
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
        {
            let index = match self.reasoning_index {
                Some(index) => index,
                None => {
                    let index = self.allocate_index();
                    self.reasoning_index = Some(index);
                    self.pending.push_back(StreamEvent::ContentBlockStart {
                        index,
                        block_type: ContentBlockType::Reasoning,
                        id: None,
                        name: None,
                    });
                    index
                }
            };
            self.pending.push_back(StreamEvent::ReasoningDelta {
                index,
                reasoning: reasoning.to_string(),
            });
        }

        if let Some(text) = delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            let index = match self.text_index {
                Some(index) => index,
                None => {
                    let index = self.allocate_index();
                    self.text_index = Some(index);
                    self.pending.push_back(StreamEvent::ContentBlockStart {
                        index,
                        block_type: ContentBlockType::Text,
                        id: None,
                        name: None,
                    });
                    index
                }
            };
            self.pending.push_back(StreamEvent::TextDelta {
                index,
                text: text.to_string(),
            });
        }

        let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) else {
            return;
        };
        for call in tool_calls {
            let key = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let function = call.get("function").unwrap_or(&Value::Null);
            let arguments = function
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or("");

            let index = if let Some(index) = self.tool_calls.get(&key) {
                *index
            } else {
                let index = self.allocate_index();
                self.tool_calls.insert(key, index);
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map_or_else(|| format!("toolcall-{key}"), ToString::to_string);
                let name = function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                self.pending.push_back(StreamEvent::ContentBlockStart {
                    index,
                    block_type: ContentBlockType::ToolUse,
                    id: Some(id),
                    name: Some(name),
                });
                index
            };

            if !arguments.is_empty() {
                self.pending.push_back(StreamEvent::InputJsonDelta {
                    index,
                    partial_json: arguments.to_string(),
                });
            }
        }
    }
}

impl<S, E> Stream for ChatCompletionsSseParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ProviderResult<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if let Err(err) = self.handle_data(&event.data) {
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(classify_stream_error(e))));
                }
                Poll::Ready(None) => {
                    self.finish(true);
                    return Poll::Ready(self.pending.pop_front().map(Ok));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" | "function_call" => "tool_use".to_string(),
        other => other.to_string(),
    }
}

/// `prompt_tokens` already includes cached tokens.
fn parse_usage(usage: &Value) -> TokenUsage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_u64)
        .or_else(|| usage.get("cached_tokens").and_then(Value::as_u64))
        .unwrap_or(0);

    TokenUsage {
        input_tokens: field("prompt_tokens"),
        output_tokens: field("completion_tokens"),
        cached_input_tokens: cached,
        cache_creation_input_tokens: 0,
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;

    fn byte_stream(
        data: &str,
        size: usize,
    ) -> impl Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>> + Unpin {
        let chunks: Vec<_> = data
            .as_bytes()
            .chunks(size)
            .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
            .collect();
        futures_util::stream::iter(chunks)
    }

    async fn collect(data: &str) -> Vec<StreamEvent> {
        let mut parser = ChatCompletionsSseParser::new(byte_stream(data, 17), "gpt-4.1".into());
        let mut events = Vec::new();
        while let Some(event) = parser.next().await {
            events.push(event.expect("valid event"));
        }
        events
    }

    #[tokio::test]
    async fn test_tool_call_stream() {
        let data = concat!(
            "data: {\"model\":\"gpt-4.1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Let me look\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"bash\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"command\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"ls\\\"}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":1000,\"completion_tokens\":500,\"prompt_tokens_details\":{\"cached_tokens\":200}}}\n\n",
            "data: [DONE]\n\n",
        );
        let events = collect(data).await;

        assert!(matches!(
            &events[0],
            StreamEvent::MessageStart { model, .. } if model == "gpt-4.1"
        ));
        assert!(matches!(
            &events[3],
            StreamEvent::ContentBlockStart {
                index: 1,
                block_type: ContentBlockType::ToolUse,
                id: Some(id),
                name: Some(name),
            }
                if id == "call_1" && name == "bash"
        ));
        let args: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::InputJsonDelta {
                    index: 1,
                    partial_json,
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(args, r#"{"command":"ls"}"#);

        let delta = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::MessageDelta { stop_reason, usage } => Some((stop_reason, usage)),
                _ => None,
            })
            .unwrap();
        assert_eq!(delta.0.as_deref(), Some("tool_use"));
        assert_eq!(
            *delta.1,
            Some(TokenUsage {
                input_tokens: 1000,
                output_tokens: 500,
                cached_input_tokens: 200,
                cache_creation_input_tokens: 0,
            })
        );
        assert_eq!(events.last(), Some(&StreamEvent::MessageCompleted));
    }

    #[tokio::test]
    async fn test_stream_without_usage_completes_at_eof() {
        let data = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}";
        let events = collect(data).await;

        assert!(events.contains(&StreamEvent::TextDelta {
            index: 0,
            text: "hi".to_string()
        }));
        assert!(events.contains(&StreamEvent::MessageDelta {
            stop_reason: Some("max_tokens".to_string()),
            usage: None,
        }));
        assert_eq!(events.last(), Some(&StreamEvent::MessageCompleted));
    }

    #[tokio::test]
    async fn test_cut_off_stream_does_not_complete() {
        let data = "data: {\"choices\":[{\"delta\":{\"content\":\"The answer is defin\"}}]}\n\n";
        let events = collect(data).await;

        assert!(events.contains(&StreamEvent::TextDelta {
            index: 0,
            text: "The answer is defin".to_string()
        }));
        assert!(!events.contains(&StreamEvent::MessageCompleted));
    }

    #[tokio::test]
    async fn test_done_marker_completes_without_finish_reason() {
        let data = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        let events = collect(data).await;
        assert_eq!(events.last(), Some(&StreamEvent::MessageCompleted));
    }

    #[tokio::test]
    async fn test_error_chunk_is_terminal() {
        let data = "data: {\"error\":{\"type\":\"server_error\",\"message\":\"boom\"}}\n\n";
        let events = collect(data).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                error_type: "server_error".to_string(),
                message: "boom".to_string(),
            }]
        );
    }

    #[test]
    fn test_request_prepends_system_and_hides_reasoning() {
        let history = vec![
            ChatMessage::user(ChatContent::Text("hi".into())),
            ChatMessage::assistant(
                None,
                Some("thinking...".into()),
                vec![ChatToolCall::new("call_1", "bash", r#"{"command":"ls"}"#)],
            ),
            ChatMessage::tool_result("call_1", "a.txt"),
        ];
        let tools = vec![ToolDefinition {
            name: "Bash".into(),
            description: "Run a command".into(),
            input_schema: json!({"type": "object"}),
        }];
        let request = TurnRequest {
            model: "o3",
            max_tokens: 1024,
            system: "be brief",
            tools: &tools,
            thinking_budget_tokens: 0,
            reasoning_effort: Some("high"),
        };

        let body = serde_json::to_value(ChatCompletionRequest::new(&history, &request)).unwrap();
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(
            body["messages"][2],
            json!({
                "role": "assistant",
                "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "bash", "arguments": "{\"command\":\"ls\"}"}}]
            })
        );
        assert_eq!(
            body["messages"][3],
            json!({"role": "tool", "content": "a.txt", "tool_call_id": "call_1"})
        );
        assert_eq!(body["tools"][0]["function"]["name"], "bash");
        assert_eq!(body["reasoning_effort"], "high");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_reasoning_effort_skipped_for_non_reasoning_models() {
        let request = TurnRequest {
            model: "gpt-4o",
            max_tokens: 1024,
            system: "",
            tools: &[],
            thinking_budget_tokens: 0,
            reasoning_effort: Some("medium"),
        };
        let body = serde_json::to_value(ChatCompletionRequest::new(&[], &request)).unwrap();
        assert!(body.get("reasoning_effort").is_none());
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"], json!([]));
    }
}
