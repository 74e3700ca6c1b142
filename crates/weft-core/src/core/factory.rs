//! Thread construction: alias resolution, provider selection and sub-agents.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::dispatch::ToolDispatcher;
use super::error::{ThreadError, ThreadResult};
use super::thread::{Backend, Thread};
use crate::config::Config;
use crate::conversations::JsonConversationStore;
use crate::providers::{OpenAiApiMode, ProviderKind, ProviderSelection, resolve_provider};

/// Maps a model alias to its target. Names that are not aliases come back
/// unchanged.
pub fn resolve_alias(model: &str, aliases: Option<&BTreeMap<String, String>>) -> String {
    let trimmed = model.trim();
    aliases
        .and_then(|map| map.get(trimmed))
        .map_or_else(|| trimmed.to_string(), |target| target.trim().to_string())
}

/// Picks the backend and bare model id for a config.
///
/// An explicit `provider` wins; otherwise the model name decides.
///
/// # Errors
/// `Config` when `provider` names no known backend.
pub fn select_provider(config: &Config) -> ThreadResult<ProviderSelection> {
    let inferred = resolve_provider(&config.model, config.openai_api_mode);
    let Some(explicit) = config.provider.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Ok(inferred);
    };

    let kind = ProviderKind::from_id(explicit)
        .ok_or_else(|| ThreadError::Config(format!("Unknown provider '{explicit}'")))?;
    // A plain "openai" still honours the configured endpoint family
    let kind = match (kind, config.openai_api_mode) {
        (ProviderKind::OpenAiChat, OpenAiApiMode::Responses) => ProviderKind::OpenAiResponses,
        (kind, _) => kind,
    };
    Ok(ProviderSelection {
        kind,
        model: inferred.model,
    })
}

/// Builds a thread for `config` with the given tools.
///
/// The caller's config is not modified; aliases resolve on a copy. Top-level
/// threads persist to the configured conversations directory.
///
/// # Errors
/// `Config` for an unknown provider or missing credentials.
pub fn new_thread(config: &Config, dispatcher: ToolDispatcher) -> ThreadResult<Thread> {
    let mut config = config.clone();
    config.model = resolve_alias(&config.model, Some(&config.aliases));
    config.weak_model = config
        .weak_model
        .as_deref()
        .map(|weak| resolve_alias(weak, Some(&config.aliases)));

    let selection = select_provider(&config)?;
    config.model = selection.model;
    let backend = Backend::connect(selection.kind, &config)?;

    let store_dir = (!config.is_sub_agent).then(|| config.effective_conversations_dir());
    let mut thread = Thread::new(config, backend, dispatcher)?;
    if let Some(dir) = store_dir {
        thread.set_store(Arc::new(JsonConversationStore::new(dir)));
    }

    info!(
        provider = %thread.provider(),
        model = thread.model(),
        sub_agent = thread.is_sub_agent(),
        "thread created"
    );
    Ok(thread)
}

/// Builds a sub-agent of `parent` with the `[subagent]` overrides applied.
///
/// The sub-agent never persists and gets the parent's tools narrowed to
/// `subagent.allowed_tools`. It keeps the parent's turn hooks. When the
/// override points at another provider that cannot be built, the sub-agent
/// falls back to the parent's provider and model.
///
/// # Errors
/// `Config` when even the fallback cannot be built.
pub fn new_subagent(parent: &Thread) -> ThreadResult<Thread> {
    let overrides = parent.config().subagent.clone();
    let mut config = parent.config().clone();
    config.is_sub_agent = true;

    if let Some(model) = overrides.model.filter(|m| !m.trim().is_empty()) {
        config.model = model;
        config.provider = None;
    }
    if let Some(provider) = overrides.provider.filter(|p| !p.trim().is_empty()) {
        config.provider = Some(provider);
    }
    if let Some(max_tokens) = overrides.max_tokens {
        config.max_tokens = max_tokens;
    }
    if let Some(effort) = overrides.reasoning_effort {
        config.reasoning_effort = effort;
    }
    if let Some(budget) = overrides.thinking_budget_tokens {
        config.thinking_budget_tokens = budget;
    }

    let dispatcher = parent.dispatcher().for_sub_agent(&overrides.allowed_tools);
    let mut thread = match new_thread(&config, dispatcher.clone()) {
        Ok(thread) => thread,
        Err(err) if matches!(err, ThreadError::Config(_)) => {
            let requested = select_provider(&config).map(|s| s.kind).ok();
            if requested == Some(parent.provider()) {
                return Err(err);
            }
            warn!(
                error = %err,
                requested = ?requested,
                fallback = %parent.provider(),
                "sub-agent provider unavailable, using the parent's"
            );
            config.provider = Some(parent.provider().id().to_string());
            config.model = parent.model().to_string();
            new_thread(&config, dispatcher)?
        }
        Err(err) => return Err(err),
    };
    if let Some(hooks) = parent.turn_hooks() {
        thread.set_turn_hooks(hooks);
    }
    Ok(thread)
}
