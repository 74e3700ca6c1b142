//! Messages API event stream → `StreamEvent` normalizer.

use std::pin::Pin;
use std::task::{Context, Poll};

use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::providers::shared::{
    ContentBlockType, ProviderError, ProviderResult, StreamEvent, TokenUsage,
    classify_stream_error,
};

/// Converts a Messages API byte stream into `StreamEvent`s.
pub struct SseParser<S> {
    inner: EventStream<S>,
}

impl<S> SseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
        }
    }
}

impl<S, E> Stream for SseParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ProviderResult<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
                Poll::Ready(Some(parse_event(&event.event, &event.data)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(classify_stream_error(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn decode<T: DeserializeOwned>(event_type: &str, data: &str) -> ProviderResult<T> {
    if data.trim().is_empty() {
        return Err(ProviderError::parse(format!("Missing data for {event_type}")));
    }
    serde_json::from_str(data).map_err(|err| {
        ProviderError::parse(format!("Failed to parse {event_type}: {err}")).with_details(data)
    })
}

pub(crate) fn parse_event(event_type: &str, data: &str) -> ProviderResult<StreamEvent> {
    match event_type {
        "ping" => Ok(StreamEvent::Ping),
        "message_start" => {
            let parsed: MessageStart = decode(event_type, data)?;
            Ok(StreamEvent::MessageStart {
                model: parsed.message.model,
                usage: parsed.message.usage.into(),
            })
        }
        "content_block_start" => {
            let parsed: BlockStart = decode(event_type, data)?;
            let block_type = parsed
                .content_block
                .block_type
                .parse::<ContentBlockType>()
                .map_err(ProviderError::parse)?;
            Ok(StreamEvent::ContentBlockStart {
                index: parsed.index,
                block_type,
                id: parsed.content_block.id,
                name: parsed.content_block.name,
            })
        }
        "content_block_delta" => {
            let BlockDelta { index, delta } = decode(event_type, data)?;
            Ok(match delta {
                Delta::Text { text } => StreamEvent::TextDelta { index, text },
                Delta::InputJson { partial_json } => StreamEvent::InputJsonDelta {
                    index,
                    partial_json,
                },
                Delta::Thinking { thinking } => StreamEvent::ReasoningDelta {
                    index,
                    reasoning: thinking,
                },
                Delta::Signature { signature } => {
                    StreamEvent::ReasoningSignatureDelta { index, signature }
                }
                // citations and other annotation deltas carry nothing we render
                Delta::Other => StreamEvent::Ping,
            })
        }
        "content_block_stop" => {
            let parsed: BlockStop = decode(event_type, data)?;
            Ok(StreamEvent::ContentBlockCompleted {
                index: parsed.index,
            })
        }
        "message_delta" => {
            let parsed: MessageDelta = decode(event_type, data)?;
            Ok(StreamEvent::MessageDelta {
                stop_reason: parsed.delta.stop_reason,
                usage: parsed.usage.map(Into::into),
            })
        }
        "message_stop" => Ok(StreamEvent::MessageCompleted),
        "error" => {
            let parsed: ErrorEvent = decode(event_type, data)?;
            Ok(StreamEvent::Error {
                error_type: parsed.error.error_type,
                message: parsed.error.message,
            })
        }
        other => Err(ProviderError::parse(format!("Unknown SSE event type: {other}"))),
    }
}

// === Event payloads ===

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    model: String,
    #[serde(default)]
    usage: WireUsage,
}

/// Anthropic reports uncached input separately from cache reads and writes.
#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage {
            input_tokens: u.input_tokens
                + u.cache_read_input_tokens
                + u.cache_creation_input_tokens,
            output_tokens: u.output_tokens,
            cached_input_tokens: u.cache_read_input_tokens,
            cache_creation_input_tokens: u.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlockStart {
    index: usize,
    content_block: StartedBlock,
}

#[derive(Debug, Deserialize)]
struct StartedBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    index: usize,
    delta: Delta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
    #[serde(rename = "thinking_delta")]
    Thinking { thinking: String },
    #[serde(rename = "signature_delta")]
    Signature { signature: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct BlockStop {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaInner {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ErrorInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
