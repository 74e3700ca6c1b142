//! Normalizer for the Responses streaming protocol.
//!
//! Output items are keyed by `output_index`. Delta events append; the paired
//! `*.done` events carry the authoritative final payload.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use serde_json::Value;

use crate::providers::shared::{
    ContentBlockType, ProviderError, ProviderResult, StreamEvent, TokenUsage,
    classify_stream_error,
};

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Arguments may arrive as a JSON string or, from some compatible servers,
/// as an already-decoded object.
fn arguments_of(value: &Value) -> Option<String> {
    match value.get("arguments")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[derive(Debug)]
enum OpenItem {
    Text { index: usize },
    Tool { index: usize, finalized: bool },
    Reasoning { index: usize, summary: String },
}

impl OpenItem {
    fn index(&self) -> usize {
        match self {
            OpenItem::Text { index }
            | OpenItem::Tool { index, .. }
            | OpenItem::Reasoning { index, .. } => *index,
        }
    }
}

pub struct ResponsesSseParser<S> {
    inner: EventStream<S>,
    model: String,
    pending: VecDeque<StreamEvent>,
    items: HashMap<u64, OpenItem>,
    next_index: usize,
    saw_tool: bool,
    finished: bool,
}

impl<S> ResponsesSseParser<S> {
    pub fn new(stream: S, model: String) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
            model,
            pending: VecDeque::new(),
            items: HashMap::new(),
            next_index: 0,
            saw_tool: false,
            finished: false,
        }
    }

    fn handle_data(&mut self, data: &str) -> ProviderResult<()> {
        let trimmed = data.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return Ok(());
        }
        let value: Value = serde_json::from_str(trimmed).map_err(|err| {
            ProviderError::parse(format!("Failed to parse Responses event JSON: {err}"))
                .with_details(trimmed)
        })?;
        self.handle_event(&value);
        Ok(())
    }

    fn push(&mut self, event: StreamEvent) {
        self.pending.push_back(event);
    }

    fn output_index(value: &Value) -> u64 {
        value
            .get("output_index")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    fn handle_event(&mut self, value: &Value) {
        let event_type = str_field(value, "type").unwrap_or("");
        match event_type {
            "response.created" => {
                let model = value
                    .get("response")
                    .and_then(|r| str_field(r, "model"))
                    .unwrap_or(&self.model)
                    .to_string();
                self.push(StreamEvent::MessageStart {
                    model,
                    usage: TokenUsage::default(),
                });
            }
            "response.output_item.added" => self.item_added(value),
            "response.output_text.delta" | "response.refusal.delta" => {
                if let Some(OpenItem::Text { index }) = self.items.get(&Self::output_index(value)) {
                    let index = *index;
                    let text = str_field(value, "delta").unwrap_or("").to_string();
                    self.push(StreamEvent::TextDelta { index, text });
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(OpenItem::Tool { index, .. }) =
                    self.items.get(&Self::output_index(value))
                {
                    let index = *index;
                    let partial_json = str_field(value, "delta").unwrap_or("").to_string();
                    self.push(StreamEvent::InputJsonDelta {
                        index,
                        partial_json,
                    });
                }
            }
            "response.function_call_arguments.done" => {
                let key = Self::output_index(value);
                self.finalize_arguments(key, arguments_of(value));
            }
            "response.reasoning_summary_text.delta" => {
                if let Some(OpenItem::Reasoning { index, summary }) =
                    self.items.get_mut(&Self::output_index(value))
                {
                    let delta = str_field(value, "delta").unwrap_or("");
                    summary.push_str(delta);
                    let index = *index;
                    self.push(StreamEvent::ReasoningDelta {
                        index,
                        reasoning: delta.to_string(),
                    });
                }
            }
            "response.output_item.done" => self.item_done(value),
            "response.completed" | "response.incomplete" | "response.done" => {
                self.complete(value.get("response").unwrap_or(&Value::Null));
            }
            "response.failed" => {
                let error = value
                    .get("response")
                    .and_then(|r| r.get("error"))
                    .unwrap_or(&Value::Null);
                self.fail(error);
            }
            "error" => self.fail(value.get("error").unwrap_or(value)),
            // queued, in_progress, content_part.*, *.done for text
            _ => self.push(StreamEvent::Ping),
        }
    }

    fn item_added(&mut self, value: &Value) {
        let key = Self::output_index(value);
        let item = value.get("item").unwrap_or(&Value::Null);
        let index = self.next_index;
        let mut inline_arguments = None;

        let (open, block_type, id, name) = match str_field(item, "type").unwrap_or("") {
            "message" => (OpenItem::Text { index }, ContentBlockType::Text, None, None),
            "function_call" => {
                self.saw_tool = true;
                inline_arguments = arguments_of(item).filter(|a| !a.is_empty());
                let call_id = str_field(item, "call_id")
                    .or_else(|| str_field(item, "id"))
                    .unwrap_or("")
                    .to_string();
                let name = str_field(item, "name").unwrap_or("").to_string();
                (
                    OpenItem::Tool {
                        index,
                        finalized: false,
                    },
                    ContentBlockType::ToolUse,
                    Some(call_id),
                    Some(name),
                )
            }
            "reasoning" => (
                OpenItem::Reasoning {
                    index,
                    summary: String::new(),
                },
                ContentBlockType::Reasoning,
                None,
                None,
            ),
            _ => {
                self.push(StreamEvent::Ping);
                return;
            }
        };

        self.next_index += 1;
        self.items.insert(key, open);
        self.push(StreamEvent::ContentBlockStart {
            index,
            block_type,
            id,
            name,
        });
        if let Some(partial_json) = inline_arguments {
            self.push(StreamEvent::InputJsonDelta {
                index,
                partial_json,
            });
        }
    }

    /// Emits the final argument string once per call. A `done` event without
    /// arguments defers to `output_item.done`.
    fn finalize_arguments(&mut self, key: u64, arguments: Option<String>) {
        let Some(OpenItem::Tool { index, finalized }) = self.items.get_mut(&key) else {
            self.push(StreamEvent::Ping);
            return;
        };
        match arguments {
            Some(arguments) if !*finalized => {
                *finalized = true;
                let index = *index;
                self.push(StreamEvent::InputJsonFinal { index, arguments });
            }
            _ => self.push(StreamEvent::Ping),
        }
    }

    fn item_done(&mut self, value: &Value) {
        let key = Self::output_index(value);
        let item = value.get("item").unwrap_or(&Value::Null);

        if matches!(self.items.get(&key), Some(OpenItem::Tool { .. })) {
            self.finalize_arguments(key, arguments_of(item));
        }

        let Some(open) = self.items.remove(&key) else {
            self.push(StreamEvent::Ping);
            return;
        };
        let index = open.index();

        if let OpenItem::Reasoning { summary, .. } = open {
            let done_summary: String = item
                .get("summary")
                .and_then(Value::as_array)
                .map(|parts| parts.iter().filter_map(|p| str_field(p, "text")).collect())
                .unwrap_or_default();
            let summary = if summary.is_empty() {
                if !done_summary.is_empty() {
                    self.push(StreamEvent::ReasoningDelta {
                        index,
                        reasoning: done_summary.clone(),
                    });
                }
                done_summary
            } else {
                summary
            };
            self.push(StreamEvent::ReasoningCompleted {
                index,
                id: str_field(item, "id").unwrap_or("").to_string(),
                encrypted_content: str_field(item, "encrypted_content").map(ToString::to_string),
                summary: (!summary.is_empty()).then_some(summary),
            });
        }

        self.push(StreamEvent::ContentBlockCompleted { index });
    }

    fn complete(&mut self, response: &Value) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut open: Vec<_> = self.items.drain().map(|(_, item)| item.index()).collect();
        open.sort_unstable();
        for index in open {
            self.push(StreamEvent::ContentBlockCompleted { index });
        }

        let stop_reason = if self.saw_tool {
            "tool_use"
        } else {
            match str_field(response, "status") {
                Some("incomplete") => "max_tokens",
                _ => "end_turn",
            }
        };
        let usage = response.get("usage").filter(|u| !u.is_null()).map(parse_usage);
        self.push(StreamEvent::MessageDelta {
            stop_reason: Some(stop_reason.to_string()),
            usage,
        });
        self.push(StreamEvent::MessageCompleted);
    }

    fn fail(&mut self, error: &Value) {
        self.finished = true;
        let error_type = str_field(error, "code")
            .or_else(|| str_field(error, "type"))
            .unwrap_or("response_failed")
            .to_string();
        let message = str_field(error, "message")
            .unwrap_or("Response failed")
            .to_string();
        self.push(StreamEvent::Error {
            error_type,
            message,
        });
    }
}

/// `input_tokens` already includes cached tokens.
fn parse_usage(usage: &Value) -> TokenUsage {
    let count = |v: Option<&Value>| v.and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input_tokens: count(usage.get("input_tokens")),
        output_tokens: count(usage.get("output_tokens")),
        cached_input_tokens: count(
            usage
                .get("input_tokens_details")
                .and_then(|d| d.get("cached_tokens")),
        ),
        cache_creation_input_tokens: 0,
    }
}

impl<S, E> Stream for ResponsesSseParser<S>
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
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
