//! Anthropic API key provider (Messages API).

use anyhow::Result;

use super::sse::SseParser;
use super::types::{ApiToolDef, Message, StreamingMessagesRequest, SystemBlock, ThinkingConfig};
use crate::config::RetryConfig;
use crate::providers::retry::send_with_retry;
use crate::providers::shared::{
    ProviderResult, ProviderStream, USER_AGENT, resolve_api_key, resolve_base_url,
};
use crate::providers::TurnRequest;

/// Default base URL for the Anthropic API.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const API_VERSION: &str = "2023-06-01";
const BETA_HEADER: &str = "fine-grained-tool-streaming-2025-05-14,interleaved-thinking-2025-05-14";
/// Smallest thinking budget the API accepts
const MIN_THINKING_BUDGET: u32 = 1024;

/// Configuration for the Anthropic client.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub retry: RetryConfig,
}

impl AnthropicConfig {
    /// Resolves credentials from config and environment.
    ///
    /// API key: config, then `ANTHROPIC_API_KEY`.
    /// Base URL: `ANTHROPIC_BASE_URL`, then config, then the public endpoint.
    ///
    /// # Errors
    /// Returns an error if no API key is available or the base URL is invalid.
    pub fn from_env(
        config_api_key: Option<&str>,
        config_base_url: Option<&str>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let api_key = resolve_api_key(config_api_key, "ANTHROPIC_API_KEY", "anthropic")?;
        let base_url = resolve_base_url(
            config_base_url,
            "ANTHROPIC_BASE_URL",
            DEFAULT_BASE_URL,
            "Anthropic",
        )?;
        Ok(Self {
            api_key,
            base_url,
            retry,
        })
    }
}

/// Anthropic API client.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    config: AnthropicConfig,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Self {
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
        messages: &[Message],
        request: &TurnRequest<'_>,
    ) -> ProviderResult<ProviderStream> {
        let tools = (!request.tools.is_empty())
            .then(|| request.tools.iter().map(ApiToolDef::from).collect());
        let system = (!request.system.trim().is_empty())
            .then(|| vec![SystemBlock::new(request.system, true)]);
        let thinking = (request.thinking_budget_tokens >= MIN_THINKING_BUDGET
            && request.thinking_budget_tokens < request.max_tokens)
            .then(|| ThinkingConfig::enabled(request.thinking_budget_tokens));

        let body = StreamingMessagesRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            messages,
            tools,
            system,
            thinking,
            stream: true,
        };

        let url = format!("{}/v1/messages", self.config.base_url);
        let response = send_with_retry(&self.config.retry, || {
            self.http
                .post(&url)
                .header("content-type", "application/json")
                .header("user-agent", USER_AGENT)
                .header("anthropic-version", API_VERSION)
                .header("anthropic-beta", BETA_HEADER)
                .header("x-api-key", &self.config.api_key)
                .json(&body)
        })
        .await?;

        Ok(Box::pin(SseParser::new(response.bytes_stream())))
    }
}
