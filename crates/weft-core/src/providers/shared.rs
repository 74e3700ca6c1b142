//! Provider-agnostic types shared across LLM backends.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use eventsource_stream::EventStreamError;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard User-Agent header for weft API requests.
pub const USER_AGENT: &str = concat!("weft/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Config resolution helpers
// ============================================================================

/// Resolves an API key with precedence: config > env.
///
/// # Errors
/// Returns an error if neither the config value nor the env var is set.
pub fn resolve_api_key(
    config_api_key: Option<&str>,
    env_var: &str,
    config_section: &str,
) -> Result<String> {
    if let Some(key) = config_api_key {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let from_env = std::env::var(env_var).context(format!(
        "No API key available. Set {env_var} or api_key in [providers.{config_section}]."
    ))?;
    let trimmed = from_env.trim();
    if trimmed.is_empty() {
        anyhow::bail!("{env_var} is set but empty");
    }
    Ok(trimmed.to_string())
}

/// Resolves a base URL with precedence: env > config > default.
///
/// # Errors
/// Returns an error if the chosen URL does not parse.
pub fn resolve_base_url(
    config_base_url: Option<&str>,
    env_var: &str,
    default_url: &str,
    provider_name: &str,
) -> Result<String> {
    if let Ok(env_url) = std::env::var(env_var)
        && !env_url.trim().is_empty()
    {
        return normalize_base_url(&env_url, provider_name);
    }

    if let Some(config_url) = config_base_url
        && !config_url.trim().is_empty()
    {
        return normalize_base_url(config_url, provider_name);
    }

    Ok(default_url.to_string())
}

/// Validates a base URL and strips surrounding whitespace and trailing
/// slashes.
///
/// # Errors
/// Returns an error if the URL does not parse.
pub fn normalize_base_url(url: &str, provider_name: &str) -> Result<String> {
    let trimmed = url.trim();
    url::Url::parse(trimmed)
        .with_context(|| format!("Invalid {provider_name} base URL: {trimmed}"))?;
    Ok(trimmed.trim_end_matches('/').to_string())
}

/// Content block kinds emitted by streaming APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentBlockType {
    Text,
    ToolUse,
    Reasoning,
}

impl FromStr for ContentBlockType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(Self::Text),
            "tool_use" | "function_call" => Ok(Self::ToolUse),
            "thinking" | "redacted_thinking" | "reasoning" => Ok(Self::Reasoning),
            _ => Err(format!("Unknown content block type: {value}")),
        }
    }
}

/// Categories of provider errors for consistent error handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection failure, timeout, or a body that broke off mid-read
    Timeout,
    /// Failed to parse response (JSON parse error, invalid SSE, etc.)
    Parse,
    /// API-level error returned by the provider mid-stream (e.g., overloaded)
    ApiError,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::HttpStatus => write!(f, "http_status"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Parse => write!(f, "parse"),
            ProviderErrorKind::ApiError => write!(f, "api_error"),
        }
    }
}

/// Structured error from the provider with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
    /// HTTP status code when the failure came from a response status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            status: None,
        }
    }

    /// Creates an HTTP status error, lifting `error.message` out of a JSON body.
    pub fn http_status(status: u16, body: &str) -> Self {
        let mut message = format!("HTTP {status}");
        if let Ok(json) = serde_json::from_str::<Value>(body)
            && let Some(error_obj) = json.get("error")
        {
            let code = error_obj
                .get("type")
                .or_else(|| error_obj.get("code"))
                .and_then(Value::as_str);
            if let Some(msg) = error_obj.get("message").and_then(Value::as_str) {
                message = match code {
                    Some(code) => format!("HTTP {status} ({code}): {msg}"),
                    None => format!("HTTP {status}: {msg}"),
                };
            }
        }
        Self {
            kind: ProviderErrorKind::HttpStatus,
            message,
            details: (!body.is_empty()).then(|| body.to_string()),
            status: Some(status),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Parse, message)
    }

    /// Creates an API error (from mid-stream error event).
    pub fn api_error(error_type: &str, message: &str) -> Self {
        Self::new(ProviderErrorKind::ApiError, format!("{error_type}: {message}"))
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Maps a reqwest transport failure onto a provider error kind.
pub fn classify_reqwest_error(e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::timeout(format!("Connection failed: {e}"))
    } else if e.is_request() {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Request error: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Network error: {e}"))
    }
}

/// Maps an event-stream failure onto a provider error kind. A body that
/// stops mid-read is a transport failure; malformed framing is a parse one.
pub fn classify_stream_error<E: std::error::Error>(e: EventStreamError<E>) -> ProviderError {
    match e {
        EventStreamError::Transport(err) => {
            ProviderError::timeout(format!("Stream interrupted: {err}"))
        }
        other => ProviderError::parse(format!("SSE stream error: {other}")),
    }
}

/// Token counts for one backend response.
///
/// `input_tokens` is always the total prompt size: cached reads and cache
/// writes are included in it, whatever the backend reports natively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Prompt tokens served from cache
    pub cached_input_tokens: u64,
    /// Prompt tokens written to cache (Anthropic only)
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    /// Folds a later usage report into this one; non-zero fields win.
    pub fn merge(&mut self, other: TokenUsage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cached_input_tokens > 0 {
            self.cached_input_tokens = other.cached_input_tokens;
        }
        if other.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = other.cache_creation_input_tokens;
        }
    }
}

/// Events emitted during streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Message started, contains model info and initial usage
    MessageStart { model: String, usage: TokenUsage },
    /// A content block has started (text, `tool_use`, reasoning)
    ContentBlockStart {
        index: usize,
        block_type: ContentBlockType,
        /// For `tool_use` blocks: the tool call ID
        id: Option<String>,
        /// For `tool_use` blocks: the tool name
        name: Option<String>,
    },
    /// Text delta within a content block
    TextDelta { index: usize, text: String },
    /// Partial JSON delta for tool input
    InputJsonDelta { index: usize, partial_json: String },
    /// Final tool arguments; replaces whatever deltas were buffered
    InputJsonFinal { index: usize, arguments: String },
    /// Reasoning delta within a reasoning content block
    ReasoningDelta { index: usize, reasoning: String },
    /// Signature delta within a reasoning content block
    ReasoningSignatureDelta { index: usize, signature: String },
    /// Reasoning item finished with opaque replay data
    ReasoningCompleted {
        index: usize,
        id: String,
        encrypted_content: Option<String>,
        summary: Option<String>,
    },
    /// A content block has ended
    ContentBlockCompleted { index: usize },
    /// Message delta (e.g., `stop_reason` update, final usage)
    MessageDelta {
        stop_reason: Option<String>,
        usage: Option<TokenUsage>,
    },
    /// Message completed
    MessageCompleted,
    /// Keepalive or status update with no content
    Ping,
    /// Error event from API
    Error { error_type: String, message: String },
}

/// Boxed stream of provider events.
pub type ProviderStream = BoxStream<'static, ProviderResult<StreamEvent>>;
