use thiserror::Error;

use crate::providers::{ProviderError, ProviderErrorKind};

/// Errors surfaced at the engine boundary.
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Transport error: {0:#}")]
    Transport(anyhow::Error),

    #[error("Persistence error: {0:#}")]
    Persistence(anyhow::Error),

    #[error("Tool '{tool}' could not be executed: {message}")]
    ToolInfrastructure { tool: String, message: String },

    /// A `user_message_send` hook rejected the message before it was sent.
    #[error("Message blocked by hook: {0}")]
    Blocked(String),
}

impl ThreadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ThreadError::Cancelled)
    }

    /// Splits provider failures into connection-level and backend-reported.
    pub(crate) fn from_provider(err: ProviderError) -> Self {
        if err.kind == ProviderErrorKind::Timeout {
            ThreadError::Transport(anyhow::Error::new(err))
        } else {
            ThreadError::Provider(err)
        }
    }
}

pub type ThreadResult<T> = std::result::Result<T, ThreadError>;
