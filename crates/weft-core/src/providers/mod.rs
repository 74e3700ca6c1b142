//! LLM provider implementations.

pub mod anthropic;
pub mod openai;
pub mod retry;
pub mod shared;

use serde::{Deserialize, Serialize};

use crate::tools::ToolDefinition;

pub use shared::{
    ContentBlockType, ProviderError, ProviderErrorKind, ProviderResult, ProviderStream,
    StreamEvent, TokenUsage, normalize_base_url, resolve_api_key, resolve_base_url,
};

/// Backend wire protocol a thread talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
    OpenAiChat,
    OpenAiResponses,
}

/// Which OpenAI endpoint family `gpt*`-style models are routed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenAiApiMode {
    #[default]
    Chat,
    Responses,
}

/// Per-exchange request parameters shared by every backend client.
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub system: &'a str,
    pub tools: &'a [ToolDefinition],
    /// Anthropic extended thinking budget (0 disables)
    pub thinking_budget_tokens: u32,
    /// OpenAI reasoning effort, sent only to reasoning models
    pub reasoning_effort: Option<&'a str>,
}

/// Provider selection result with normalized model ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub kind: ProviderKind,
    pub model: String,
}

impl ProviderKind {
    pub fn all() -> &'static [ProviderKind] {
        &[
            ProviderKind::Anthropic,
            ProviderKind::OpenAiChat,
            ProviderKind::OpenAiResponses,
        ]
    }

    /// Returns the identifier used in config files and persisted records.
    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAiChat => "openai",
            ProviderKind::OpenAiResponses => "openai-responses",
        }
    }

    /// Returns the `ProviderKind` for a given id string.
    pub fn from_id(id: &str) -> Option<ProviderKind> {
        match id.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            "openai" | "openai-chat" => Some(ProviderKind::OpenAiChat),
            "openai-responses" | "responses" => Some(ProviderKind::OpenAiResponses),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::OpenAiChat => "OpenAI",
            ProviderKind::OpenAiResponses => "OpenAI Responses",
        }
    }

    pub fn api_key_env_var(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::OpenAiChat | ProviderKind::OpenAiResponses => "OPENAI_API_KEY",
        }
    }

    pub fn base_url_env_var(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_BASE_URL",
            ProviderKind::OpenAiChat | ProviderKind::OpenAiResponses => "OPENAI_BASE_URL",
        }
    }

    /// Two kinds in the same family share credentials and pricing tables.
    pub fn is_openai(&self) -> bool {
        matches!(
            self,
            ProviderKind::OpenAiChat | ProviderKind::OpenAiResponses
        )
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Resolves provider and model from a model identifier.
///
/// Supports an explicit `provider:model` prefix. Without a prefix the provider
/// is inferred from the model name; unknown names default to Anthropic.
pub fn resolve_provider(model: &str, api_mode: OpenAiApiMode) -> ProviderSelection {
    let trimmed = model.trim();

    if let Some((prefix, rest)) = trimmed.split_once(':')
        && let Some(kind) = ProviderKind::from_id(prefix)
        && !rest.is_empty()
    {
        return ProviderSelection {
            kind,
            model: rest.to_string(),
        };
    }

    ProviderSelection {
        kind: provider_for_model(trimmed, api_mode),
        model: trimmed.to_string(),
    }
}

/// Infers the provider from model naming conventions.
pub fn provider_for_model(model: &str, api_mode: OpenAiApiMode) -> ProviderKind {
    const OPENAI_PREFIXES: &[&str] = &["gpt", "o1", "o3", "o4", "codex", "chatgpt"];

    let lower = model.trim().to_lowercase();
    if OPENAI_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return match api_mode {
            OpenAiApiMode::Chat => ProviderKind::OpenAiChat,
            OpenAiApiMode::Responses => ProviderKind::OpenAiResponses,
        };
    }
    ProviderKind::Anthropic
}
