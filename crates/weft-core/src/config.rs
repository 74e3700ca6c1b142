//! Configuration management for weft.
//!
//! Loads configuration from ${WEFT_HOME}/config.toml with sensible defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::providers::{OpenAiApiMode, ProviderKind};

pub mod paths {
    //! Path resolution for weft configuration and data directories.
    //!
    //! WEFT_HOME resolution order:
    //! 1. WEFT_HOME environment variable (if set)
    //! 2. ~/.config/weft (default)

    use std::path::PathBuf;

    /// Returns the weft home directory.
    pub fn weft_home() -> PathBuf {
        if let Ok(home) = std::env::var("WEFT_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".weft"),
            |h| h.join(".config").join("weft"),
        )
    }

    pub fn config_path() -> PathBuf {
        weft_home().join("config.toml")
    }

    /// Returns the directory holding persisted conversation records.
    pub fn conversations_dir() -> PathBuf {
        weft_home().join("conversations")
    }

    pub fn logs_dir() -> PathBuf {
        weft_home().join("logs")
    }
}

/// Credentials and endpoint for one provider family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Endpoint injected by the embedding program. Wins over the
    /// `*_BASE_URL` env var and `base_url`; never read from the file.
    #[serde(skip)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: ProviderSettings,
    pub openai: ProviderSettings,
}

impl ProvidersConfig {
    /// Returns the settings for a provider kind; both OpenAI modes share one section.
    pub fn get(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::OpenAiChat | ProviderKind::OpenAiResponses => &self.openai,
        }
    }

    /// Config section name used in error messages.
    pub fn section_name(kind: ProviderKind) -> &'static str {
        if kind.is_openai() { "openai" } else { "anthropic" }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Exponential,
    Fixed,
}

/// Retry policy for the initial HTTP request of each exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed => self.initial_delay_ms,
            Backoff::Exponential => self
                .initial_delay_ms
                .saturating_mul(1_u64 << attempt.saturating_sub(1).min(16)),
        };
        Duration::from_millis(base.min(self.max_delay_ms))
    }
}

/// Overrides applied when a thread spawns a sub-agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubAgentSettings {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
    pub thinking_budget_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Also write logs to a daily file under `$WEFT_HOME/logs`
    pub file: bool,
    /// Override for the log directory
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: false,
            dir: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Explicit provider id; inferred from the model name when unset
    pub provider: Option<String>,

    pub model: String,

    /// Cheaper model used for summaries and `use_weak_model` sends
    pub weak_model: Option<String>,

    pub max_tokens: u32,

    pub weak_model_max_tokens: u32,

    /// Anthropic extended-thinking budget (0 disables)
    pub thinking_budget_tokens: u32,

    /// OpenAI reasoning effort for reasoning models
    pub reasoning_effort: String,

    pub openai_api_mode: OpenAiApiMode,

    /// Move the Anthropic prompt-cache breakpoint every N turns
    pub cache_every: u32,

    /// Tools advertised to the model (empty = all registered tools)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,

    /// Model aliases, e.g. `sonnet = "claude-sonnet-4-20250514"`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, String>,

    /// Extra instructions appended to the rendered system prompt
    pub system_prompt: Option<String>,

    pub retry: RetryConfig,

    pub subagent: SubAgentSettings,

    pub providers: ProvidersConfig,

    pub logging: LoggingConfig,

    pub conversations_dir: Option<PathBuf>,

    /// Runtime flag set by the factory for sub-agent threads
    #[serde(skip)]
    pub is_sub_agent: bool,
}

impl Config {
    pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
    const DEFAULT_MAX_TOKENS: u32 = 8192;
    const DEFAULT_REASONING_EFFORT: &str = "medium";
    const DEFAULT_CACHE_EVERY: u32 = 10;

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Returns the model and token limit to use for a send.
    pub fn model_for(&self, use_weak_model: bool) -> (&str, u32) {
        match (&self.weak_model, use_weak_model) {
            (Some(weak), true) if !weak.trim().is_empty() => {
                (weak.as_str(), self.weak_model_max_tokens)
            }
            _ => (self.model.as_str(), self.max_tokens),
        }
    }

    pub fn effective_conversations_dir(&self) -> PathBuf {
        self.conversations_dir
            .clone()
            .unwrap_or_else(paths::conversations_dir)
    }

    pub fn effective_logs_dir(&self) -> PathBuf {
        self.logging.dir.clone().unwrap_or_else(paths::logs_dir)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: None,
            model: Self::DEFAULT_MODEL.to_string(),
            weak_model: None,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            weak_model_max_tokens: Self::DEFAULT_MAX_TOKENS,
            thinking_budget_tokens: 0,
            reasoning_effort: Self::DEFAULT_REASONING_EFFORT.to_string(),
            openai_api_mode: OpenAiApiMode::default(),
            cache_every: Self::DEFAULT_CACHE_EVERY,
            allowed_tools: Vec::new(),
            aliases: BTreeMap::new(),
            system_prompt: None,
            retry: RetryConfig::default(),
            subagent: SubAgentSettings::default(),
            providers: ProvidersConfig::default(),
            logging: LoggingConfig::default(),
            conversations_dir: None,
            is_sub_agent: false,
        }
    }
}
