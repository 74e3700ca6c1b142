//! The thread: one conversation's turn loop.
//!
//! A send appends the user message, then alternates backend exchanges and
//! tool dispatch until the model answers without tool calls, the turn cap is
//! hit, or something fails. History is saved after every exchange so a crash
//! loses at most the exchange in flight.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::{ToolCallOutcome, ToolDispatcher};
use super::error::{ThreadError, ThreadResult};
use super::handler::{MessageHandler, StringCollectorHandler};
use super::history::History;
use super::hooks::{MessageDecision, TurnHooks, TurnSummary};
use super::pricing::{ModelPricing, pricing_for};
use super::turn::{AssistantTurn, ToolCall, TurnCollector};
use super::usage::Usage;
use crate::config::Config;
use crate::conversations::{
    ConversationRecord, ConversationStore, ToolExecution, generate_id, merge_tool_executions,
};
use crate::images::load_images;
use crate::prompts::{COMPACT_PROMPT, SUMMARY_PROMPT, render_system_prompt};
use crate::providers::anthropic::{AnthropicClient, AnthropicConfig};
use crate::providers::openai::{ChatCompletionsClient, OpenAiConfig, ResponsesClient};
use crate::providers::{
    ProviderError, ProviderKind, ProviderStream, TurnRequest, normalize_base_url, resolve_provider,
};
use crate::tools::{StructuredToolResult, ToolDefinition};

const SUMMARY_FALLBACK: &str = "Could not generate summary.";

/// Client for the backend a thread talks to.
#[derive(Debug, Clone)]
pub enum Backend {
    Anthropic(AnthropicClient),
    OpenAiChat(ChatCompletionsClient),
    OpenAiResponses(ResponsesClient),
}

impl Backend {
    /// Builds the client for `kind` from config and environment.
    ///
    /// # Errors
    /// `Config` when credentials are missing or the base URL is invalid.
    pub fn connect(kind: ProviderKind, config: &Config) -> ThreadResult<Self> {
        Self::build(kind, config).map_err(|err| ThreadError::Config(format!("{err:#}")))
    }

    fn build(kind: ProviderKind, config: &Config) -> anyhow::Result<Self> {
        let settings = config.providers.get(kind);
        let api_key = settings.api_key.as_deref();
        let base_url = settings.base_url.as_deref();
        let endpoint = settings
            .endpoint
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| normalize_base_url(url, kind.label()))
            .transpose()?;
        let retry = config.retry.clone();

        if kind == ProviderKind::Anthropic {
            let mut client_config = AnthropicConfig::from_env(api_key, base_url, retry)?;
            if let Some(url) = endpoint {
                client_config.base_url = url;
            }
            return Ok(Backend::Anthropic(AnthropicClient::new(client_config)));
        }

        let mut client_config = OpenAiConfig::from_env(api_key, base_url, retry)?;
        if let Some(url) = endpoint {
            client_config.base_url = url;
        }
        Ok(match kind {
            ProviderKind::OpenAiResponses => {
                Backend::OpenAiResponses(ResponsesClient::new(client_config))
            }
            _ => Backend::OpenAiChat(ChatCompletionsClient::new(client_config)),
        })
    }

    /// Base URL requests go to.
    pub fn base_url(&self) -> &str {
        match self {
            Backend::Anthropic(client) => client.base_url(),
            Backend::OpenAiChat(client) => client.base_url(),
            Backend::OpenAiResponses(client) => client.base_url(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Backend::Anthropic(_) => ProviderKind::Anthropic,
            Backend::OpenAiChat(_) => ProviderKind::OpenAiChat,
            Backend::OpenAiResponses(_) => ProviderKind::OpenAiResponses,
        }
    }

    async fn send(
        &self,
        history: &History,
        request: &TurnRequest<'_>,
    ) -> ThreadResult<ProviderStream> {
        let stream = match (self, history) {
            (Backend::Anthropic(client), History::Anthropic(messages)) => {
                client.send_messages_stream(messages, request).await
            }
            (Backend::OpenAiChat(client), History::OpenAiChat(messages)) => {
                client.send_messages_stream(messages, request).await
            }
            (Backend::OpenAiResponses(client), History::OpenAiResponses(items)) => {
                client.send_items_stream(items, request).await
            }
            _ => {
                return Err(ThreadError::Config(format!(
                    "{} history cannot be sent to the {} backend",
                    history.kind(),
                    self.kind()
                )));
            }
        };
        stream.map_err(provider_failure)
    }
}

fn provider_failure(err: ProviderError) -> ThreadError {
    error!(
        kind = %err.kind,
        message = %err.message,
        details = err.details.as_deref().unwrap_or_default(),
        "provider request failed"
    );
    ThreadError::from_provider(err)
}

/// Per-send options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    /// Cap on backend exchanges for this send (0 = unlimited)
    pub max_turns: u32,
    /// Compact when `current / max` context reaches this ratio (0 disables)
    pub compact_ratio: f64,
    pub disable_auto_compact: bool,
    /// Image URLs or paths attached to the user message
    pub images: Vec<String>,
    pub use_weak_model: bool,
    /// Anthropic prompt-cache breakpoints
    pub prompt_cache: bool,
    /// Advertise no tools
    pub no_tool_use: bool,
    /// Leave history and storage untouched
    pub no_save_conversation: bool,
}

/// Why a send finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without tool calls
    Completed,
    /// The model hit its output token limit
    MaxTokens,
    /// `max_turns` exchanges ran and the model still wanted tools
    MaxTurns,
}

/// Model, limits and tools for one send.
struct SendPlan {
    model: String,
    max_tokens: u32,
    tools: Vec<ToolDefinition>,
    pricing: ModelPricing,
}

pub struct Thread {
    config: Config,
    kind: ProviderKind,
    backend: Backend,
    history: History,
    usage: Arc<Mutex<Usage>>,
    tool_results: BTreeMap<String, StructuredToolResult>,
    pending_executions: BTreeMap<usize, Vec<ToolExecution>>,
    conversation_id: String,
    created_at: DateTime<Utc>,
    summary: String,
    persistence_enabled: bool,
    store: Option<Arc<dyn ConversationStore>>,
    dispatcher: ToolDispatcher,
    turn_hooks: Option<Arc<dyn TurnHooks>>,
    system_prompt: String,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("kind", &self.kind)
            .field("model", &self.config.model)
            .field("conversation_id", &self.conversation_id)
            .field("messages", &self.history.len())
            .field("is_sub_agent", &self.config.is_sub_agent)
            .finish_non_exhaustive()
    }
}

impl Thread {
    /// Builds a thread around an existing backend. Most callers go through
    /// [`crate::core::factory::new_thread`].
    ///
    /// # Errors
    /// `Config` when the system prompt cannot be rendered.
    pub fn new(config: Config, backend: Backend, dispatcher: ToolDispatcher) -> ThreadResult<Self> {
        let kind = backend.kind();
        let dispatcher = dispatcher.filtered(&config.allowed_tools);
        let mut system_prompt = render_system_prompt(
            kind,
            &config.model,
            dispatcher.definitions(),
            config.is_sub_agent,
        )
        .map_err(|err| ThreadError::Config(format!("{err:#}")))?;
        if let Some(extra) = config.system_prompt.as_deref().map(str::trim)
            && !extra.is_empty()
        {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(extra);
        }

        Ok(Self {
            persistence_enabled: !config.is_sub_agent,
            kind,
            backend,
            history: History::new(kind),
            usage: Arc::new(Mutex::new(Usage::default())),
            tool_results: BTreeMap::new(),
            pending_executions: BTreeMap::new(),
            conversation_id: generate_id(),
            created_at: Utc::now(),
            summary: String::new(),
            store: None,
            dispatcher,
            turn_hooks: None,
            system_prompt,
            config,
        })
    }

    pub fn provider(&self) -> ProviderKind {
        self.kind
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_sub_agent(&self) -> bool {
        self.config.is_sub_agent
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn set_conversation_id(&mut self, id: impl Into<String>) {
        self.conversation_id = id.into();
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    pub fn tool_results(&self) -> &BTreeMap<String, StructuredToolResult> {
        &self.tool_results
    }

    pub fn set_store(&mut self, store: Arc<dyn ConversationStore>) {
        self.store = Some(store);
    }

    pub fn set_turn_hooks(&mut self, hooks: Arc<dyn TurnHooks>) {
        self.turn_hooks = Some(hooks);
    }

    pub fn turn_hooks(&self) -> Option<Arc<dyn TurnHooks>> {
        self.turn_hooks.clone()
    }

    pub fn set_persistence_enabled(&mut self, enabled: bool) {
        self.persistence_enabled = enabled;
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence_enabled && self.store.is_some()
    }

    /// Snapshot of the running usage totals.
    pub fn get_usage(&self) -> Usage {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Shared usage counters, for status displays that poll mid-send.
    pub fn usage_handle(&self) -> Arc<Mutex<Usage>> {
        Arc::clone(&self.usage)
    }

    /// Folds a finished sub-agent's tokens and costs into this thread.
    pub fn aggregate_subagent_usage(&self, sub_agent: &Usage) {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_subagent(sub_agent);
    }

    /// Records a tool execution for the assistant message at `message_index`.
    /// It is written on the next save.
    pub fn add_tool_execution(&mut self, message_index: usize, execution: ToolExecution) {
        self.pending_executions
            .entry(message_index)
            .or_default()
            .push(execution);
    }

    /// Sends a user message and runs the turn loop to completion.
    ///
    /// `handle_done` fires exactly once per call for top-level threads,
    /// whatever the outcome. Cancelling `cancel` aborts the exchange or tool
    /// dispatch in flight and returns [`ThreadError::Cancelled`].
    ///
    /// # Errors
    /// Provider, transport and tool-infrastructure failures end the send; the
    /// history keeps every complete exchange. A message rejected by a
    /// `user_message_send` hook returns [`ThreadError::Blocked`] untouched.
    pub async fn send_message(
        &mut self,
        text: &str,
        handler: &dyn MessageHandler,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> ThreadResult<StopReason> {
        let snapshot = options
            .no_save_conversation
            .then(|| (self.history.clone(), self.pending_executions.clone()));

        let result = self.run_turns(text, handler, options, cancel).await;

        if let Some((history, pending)) = snapshot {
            self.history = history;
            self.pending_executions = pending;
        }
        if !self.config.is_sub_agent {
            handler.handle_done();
        }
        result
    }

    async fn run_turns(
        &mut self,
        text: &str,
        handler: &dyn MessageHandler,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> ThreadResult<StopReason> {
        let persist = !options.no_save_conversation;
        let hooks = self.turn_hooks.clone();
        if let Some(hooks) = &hooks
            && let MessageDecision::Block(reason) = hooks.user_message_send(text).await
        {
            warn!(reason = %reason, "user message blocked by hook");
            return Err(ThreadError::Blocked(reason));
        }
        let plan = self.plan(options);
        let images = load_images(&options.images).await;
        self.history.push_user(text, &images);

        let mut turn_count: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(self.abort(ThreadError::Cancelled, persist).await);
            }

            debug!(turn_count, max_turns = options.max_turns, "checking turn limit");
            if options.max_turns > 0 && turn_count >= options.max_turns {
                info!(max_turns = options.max_turns, "turn limit reached");
                self.finish(persist).await;
                return Ok(StopReason::MaxTurns);
            }

            if self.should_compact(options)
                && let Err(err) = self.compact_context(cancel).await
            {
                if err.is_cancelled() {
                    return Err(self.abort(err, persist).await);
                }
                warn!(error = %err, "context compaction failed, continuing");
            }

            if options.prompt_cache
                && self.config.cache_every > 0
                && turn_count % self.config.cache_every == 0
            {
                self.history.mark_cache_breakpoint();
            }
            turn_count += 1;

            let request = TurnRequest {
                model: &plan.model,
                max_tokens: plan.max_tokens,
                system: &self.system_prompt,
                tools: &plan.tools,
                thinking_budget_tokens: self.config.thinking_budget_tokens,
                reasoning_effort: Some(self.config.reasoning_effort.as_str())
                    .filter(|e| !e.is_empty()),
            };
            let turn = match self.exchange(&self.history, &request, handler, cancel).await {
                Ok(turn) => turn,
                Err(err) => return Err(self.abort(err, persist).await),
            };
            self.record_usage(&turn, &plan.pricing);

            let message_index = self.history.push_assistant(&turn);
            let tools_used = turn.has_tool_calls();
            if tools_used {
                let calls: Vec<ToolCall> = turn.tool_calls().cloned().collect();
                let outcomes = match self.dispatcher.dispatch(&calls, handler, cancel).await {
                    Ok(outcomes) => outcomes,
                    Err(err) => return Err(self.abort(err, persist).await),
                };
                self.record_outcomes(message_index, &outcomes);
                self.history.push_tool_results(&outcomes);
            }

            let Some(hooks) = &hooks else {
                if !tools_used {
                    self.finish(persist).await;
                    return Ok(stop_reason_for(&turn));
                }
                self.save_progress(persist).await;
                continue;
            };

            let last_output = turn.text();
            let summary = TurnSummary {
                turn: turn_count,
                tools_used,
                usage: self.get_usage(),
                last_output: &last_output,
                is_sub_agent: self.config.is_sub_agent,
            };
            if let Some(replacement) = hooks.after_turn(&summary, &self.history).await {
                self.replace_history(replacement);
            }

            if !tools_used {
                let follow_ups = hooks.agent_stop(&self.history, &self.get_usage()).await;
                if follow_ups.is_empty() {
                    self.finish(persist).await;
                    return Ok(stop_reason_for(&turn));
                }
                info!(count = follow_ups.len(), "agent_stop hook returned follow-ups, continuing");
                for follow_up in &follow_ups {
                    handler.handle_text(&format!("\nHook follow-up: {follow_up}\n"));
                    self.history.push_user(follow_up, &[]);
                }
            }
            self.save_progress(persist).await;
        }
    }

    async fn save_progress(&mut self, persist: bool) {
        if persist && let Err(err) = self.save_conversation(false).await {
            warn!(error = %err, "failed to save conversation");
        }
    }

    /// Swaps in a hook-edited history. One in another provider format is
    /// ignored.
    fn replace_history(&mut self, replacement: History) {
        if replacement.kind() != self.kind {
            warn!(
                expected = %self.kind,
                got = %replacement.kind(),
                "after_turn hook returned a history for another provider, ignoring it"
            );
            return;
        }
        info!(
            before = self.history.len(),
            after = replacement.len(),
            "after_turn hook replaced the history"
        );
        self.history = replacement;
        // Indices of unsaved executions no longer point at real messages
        self.pending_executions.clear();
    }

    fn plan(&self, options: &SendOptions) -> SendPlan {
        let (model, max_tokens) = self.config.model_for(options.use_weak_model);
        let model = resolve_provider(model, self.config.openai_api_mode).model;
        let tools = if options.no_tool_use {
            Vec::new()
        } else {
            self.dispatcher.definitions().to_vec()
        };
        SendPlan {
            pricing: pricing_for(self.kind, &model),
            model,
            max_tokens,
            tools,
        }
    }

    /// Runs one backend exchange over `history`.
    async fn exchange(
        &self,
        history: &History,
        request: &TurnRequest<'_>,
        handler: &dyn MessageHandler,
        cancel: &CancellationToken,
    ) -> ThreadResult<AssistantTurn> {
        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ThreadError::Cancelled),
            stream = self.backend.send(history, request) => stream?,
        };

        let mut collector = TurnCollector::new(handler);
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ThreadError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => collector.apply(event).map_err(provider_failure)?,
                Some(Err(err)) => return Err(provider_failure(err)),
                None => break,
            }
        }
        if !collector.is_completed() {
            error!(provider = %self.kind, "stream ended before the response completed");
            return Err(ThreadError::Transport(anyhow::anyhow!(
                "{} stream ended before completion",
                self.kind
            )));
        }
        Ok(collector.finish())
    }

    fn record_usage(&self, turn: &AssistantTurn, pricing: &ModelPricing) {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_turn(&turn.usage, pricing);
    }

    fn record_outcomes(&mut self, message_index: Option<usize>, outcomes: &[ToolCallOutcome]) {
        for outcome in outcomes {
            self.tool_results
                .insert(outcome.call_id.clone(), outcome.output.result.clone());
            if let Some(index) = message_index {
                self.add_tool_execution(
                    index,
                    ToolExecution {
                        tool_name: outcome.name.clone(),
                        call_id: outcome.call_id.clone(),
                        input: outcome.input.to_string(),
                        user_facing: outcome.output.user_facing().to_string(),
                    },
                );
            }
        }
    }

    /// Final save of a successful send, with a fresh summary.
    async fn finish(&mut self, persist: bool) {
        if persist && let Err(err) = self.save_conversation(true).await {
            warn!(error = %err, "failed to save conversation");
        }
    }

    /// Drops the incomplete tail, saves what is left and hands `err` back.
    async fn abort(&mut self, err: ThreadError, persist: bool) -> ThreadError {
        if err.is_cancelled() {
            info!("send cancelled");
        }
        self.history.repair();
        if persist && let Err(save_err) = self.save_conversation(false).await {
            warn!(error = %save_err, "failed to save conversation after error");
        }
        err
    }

    fn should_compact(&self, options: &SendOptions) -> bool {
        if options.disable_auto_compact
            || options.compact_ratio <= 0.0
            || options.compact_ratio > 1.0
        {
            return false;
        }
        let Some(ratio) = self.get_usage().context_ratio() else {
            return false;
        };
        debug!(ratio, threshold = options.compact_ratio, "checking context usage");
        ratio >= options.compact_ratio
    }

    /// Replaces the history with a model-written summary of it.
    ///
    /// Runs on the main model with no tools. Structured tool results are kept.
    ///
    /// # Errors
    /// Fails when the exchange fails or the model returns no text.
    pub async fn compact_context(&mut self, cancel: &CancellationToken) -> ThreadResult<()> {
        let mut scratch = self.history.clone();
        scratch.repair();
        if scratch.is_empty() {
            return Ok(());
        }
        scratch.push_user(COMPACT_PROMPT, &[]);

        let model = resolve_provider(&self.config.model, self.config.openai_api_mode).model;
        let request = TurnRequest {
            model: &model,
            max_tokens: self.config.max_tokens,
            system: &self.system_prompt,
            tools: &[],
            thinking_budget_tokens: 0,
            reasoning_effort: None,
        };
        let collector = StringCollectorHandler::new(true);
        let turn = self.exchange(&scratch, &request, &collector, cancel).await?;
        self.record_usage(&turn, &pricing_for(self.kind, &model));

        let summary = turn.text();
        if summary.trim().is_empty() {
            return Err(ThreadError::Provider(ProviderError::parse(
                "Compaction returned an empty summary",
            )));
        }

        let before = self.history.len();
        let mut compacted = History::new(self.kind);
        compacted.push_user(
            &format!("Summary of the conversation so far:\n\n{}", summary.trim()),
            &[],
        );
        self.history = compacted;
        // Indices of unsaved executions no longer point at real messages
        self.pending_executions.clear();
        info!(before, "context compacted");
        Ok(())
    }

    /// One-line summary of the conversation from the weak model.
    pub async fn short_summary(&self) -> String {
        let mut scratch = self.history.clone();
        scratch.repair();
        if scratch.is_empty() {
            return SUMMARY_FALLBACK.to_string();
        }
        scratch.push_user(SUMMARY_PROMPT, &[]);

        let (model, max_tokens) = self.config.model_for(true);
        let model = resolve_provider(model, self.config.openai_api_mode).model;
        let request = TurnRequest {
            model: &model,
            max_tokens,
            system: &self.system_prompt,
            tools: &[],
            thinking_budget_tokens: 0,
            reasoning_effort: None,
        };
        let collector = StringCollectorHandler::new(true);
        match self
            .exchange(&scratch, &request, &collector, &CancellationToken::new())
            .await
        {
            Ok(turn) => {
                self.record_usage(&turn, &pricing_for(self.kind, &model));
                let text = collector.collected_text();
                match text.trim() {
                    "" => SUMMARY_FALLBACK.to_string(),
                    summary => summary.to_string(),
                }
            }
            Err(err) => {
                warn!(error = %err, "summary generation failed");
                SUMMARY_FALLBACK.to_string()
            }
        }
    }

    /// Writes the conversation to the store.
    ///
    /// The stored record is read first: its tool executions are kept and
    /// this thread's new ones appended, and its creation time is preserved.
    /// A failed save leaves the thread untouched apart from the repaired tail.
    ///
    /// # Errors
    /// `Persistence` when the store cannot be read or written.
    pub async fn save_conversation(&mut self, summarize: bool) -> ThreadResult<()> {
        if !self.persistence_enabled {
            return Ok(());
        }
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        self.history.repair();
        if self.history.is_empty() {
            return Ok(());
        }
        if summarize {
            self.summary = self.short_summary().await;
        }

        let raw_messages = self
            .history
            .to_json()
            .map_err(|err| ThreadError::Persistence(err.into()))?;
        let existing = store
            .load(&self.conversation_id)
            .await
            .map_err(ThreadError::Persistence)?;
        let mut record = existing.unwrap_or_else(|| {
            let mut record = ConversationRecord::new(&self.conversation_id, self.kind.id());
            record.created_at = self.created_at;
            record
        });

        record.provider = self.kind.id().to_string();
        record.model.clone_from(&self.config.model);
        record.raw_messages = raw_messages;
        record
            .tool_results
            .extend(self.tool_results.iter().map(|(k, v)| (k.clone(), v.clone())));
        merge_tool_executions(
            &mut record.tool_executions_by_message,
            &self.pending_executions,
        );
        record.usage = self.get_usage();
        if !self.summary.is_empty() {
            record.summary.clone_from(&self.summary);
        }
        record.updated_at = Utc::now();

        store
            .save(&record)
            .await
            .map_err(ThreadError::Persistence)?;
        self.pending_executions.clear();
        debug!(id = %record.id, messages = record.message_count(), "conversation saved");
        Ok(())
    }

    /// Restores a stored conversation into this thread.
    ///
    /// # Errors
    /// `Config` when no store is set or the record was written by another
    /// backend, `Persistence` when it cannot be read or decoded.
    pub async fn load_conversation(&mut self, id: &str) -> ThreadResult<()> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| ThreadError::Config("No conversation store configured".to_string()))?;
        let record = store
            .load(id)
            .await
            .map_err(ThreadError::Persistence)?
            .ok_or_else(|| {
                ThreadError::Persistence(anyhow::anyhow!("Conversation not found: {id}"))
            })?;

        let kind = ProviderKind::from_id(&record.provider);
        if kind != Some(self.kind) {
            return Err(ThreadError::Config(format!(
                "Conversation {id} was recorded with provider '{}' but this thread uses '{}'",
                record.provider, self.kind
            )));
        }

        let mut history = History::from_json(self.kind, &record.raw_messages)
            .map_err(|err| ThreadError::Persistence(err.into()))?;
        let removed = history.repair();
        if removed > 0 {
            warn!(id, removed, "dropped incomplete messages from stored conversation");
        }

        self.history = history;
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner) = record.usage;
        self.tool_results = record.tool_results;
        self.pending_executions.clear();
        self.summary = record.summary;
        self.created_at = record.created_at;
        self.conversation_id = record.id;
        Ok(())
    }
}

fn stop_reason_for(turn: &AssistantTurn) -> StopReason {
    match turn.stop_reason.as_deref() {
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::Completed,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::conversations::{QueryOptions, QueryResult};
    use crate::providers::TokenUsage;

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<HashMap<String, ConversationRecord>>,
    }

    #[async_trait]
    impl ConversationStore for MemoryStore {
        async fn save(&self, record: &ConversationRecord) -> anyhow::Result<()> {
            self.records
                .lock()
                .unwrap()
                .insert(record.id.clone(), record.clone());
            Ok(())
        }

        async fn load(&self, id: &str) -> anyhow::Result<Option<ConversationRecord>> {
            Ok(self.records.lock().unwrap().get(id).cloned())
        }

        async fn query(&self, _options: &QueryOptions) -> anyhow::Result<QueryResult> {
            Ok(QueryResult::default())
        }

        async fn delete(&self, id: &str) -> anyhow::Result<()> {
            self.records.lock().unwrap().remove(id);
            Ok(())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ConversationStore for FailingStore {
        async fn save(&self, _record: &ConversationRecord) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }

        async fn load(&self, _id: &str) -> anyhow::Result<Option<ConversationRecord>> {
            Ok(None)
        }

        async fn query(&self, _options: &QueryOptions) -> anyhow::Result<QueryResult> {
            Ok(QueryResult::default())
        }

        async fn delete(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.providers.anthropic.api_key = Some("test-key".to_string());
        config.providers.anthropic.endpoint = Some("http://127.0.0.1:9".to_string());
        config.providers.openai.api_key = Some("test-key".to_string());
        config.providers.openai.endpoint = Some("http://127.0.0.1:9".to_string());
        config
    }

    fn thread(kind: ProviderKind) -> Thread {
        let config = test_config();
        let backend = Backend::connect(kind, &config).unwrap();
        Thread::new(config, backend, ToolDispatcher::default()).unwrap()
    }

    fn execution(tool: &str, call_id: &str) -> ToolExecution {
        ToolExecution {
            tool_name: tool.to_string(),
            call_id: call_id.to_string(),
            input: "{}".to_string(),
            user_facing: format!("{tool} done"),
        }
    }

    fn seed_exchange(thread: &mut Thread) {
        let raw = json!([
            {"role": "user", "content": [{"type": "text", "text": "list files"}]},
            {"role": "assistant", "content": [{"type": "text", "text": "Done"}]}
        ]);
        thread.history = History::from_json(ProviderKind::Anthropic, &raw).unwrap();
    }

    #[test]
    fn test_missing_credentials_is_config_error() {
        if std::env::var("OPENAI_API_KEY").is_ok() {
            return;
        }
        let result = Backend::connect(ProviderKind::OpenAiChat, &Config::default());
        assert!(matches!(result, Err(ThreadError::Config(_))));
    }

    #[test]
    fn test_backend_kind() {
        let config = test_config();
        for kind in ProviderKind::all() {
            assert_eq!(Backend::connect(*kind, &config).unwrap().kind(), *kind);
        }
    }

    #[test]
    fn test_injected_endpoint_replaces_config_base_url() {
        let mut config = test_config();
        config.providers.openai.base_url = Some("https://proxy.example.com/v1".to_string());
        config.providers.openai.endpoint = Some(" http://127.0.0.1:4010/v1/ ".to_string());
        let backend = Backend::connect(ProviderKind::OpenAiResponses, &config).unwrap();
        assert_eq!(backend.base_url(), "http://127.0.0.1:4010/v1");

        config.providers.openai.endpoint = Some("not a url".to_string());
        assert!(matches!(
            Backend::connect(ProviderKind::OpenAiChat, &config),
            Err(ThreadError::Config(_))
        ));
    }

    #[test]
    fn test_system_prompt_includes_extra_instructions() {
        let mut config = test_config();
        config.system_prompt = Some("Always answer in French.".to_string());
        let backend = Backend::connect(ProviderKind::Anthropic, &config).unwrap();
        let thread = Thread::new(config, backend, ToolDispatcher::default()).unwrap();
        assert!(thread.system_prompt().ends_with("Always answer in French."));
        assert!(thread.persistence_enabled);
        assert!(!thread.persistence_enabled(), "no store yet");
    }

    #[test]
    fn test_stop_reason_mapping() {
        let mut turn = AssistantTurn::default();
        assert_eq!(stop_reason_for(&turn), StopReason::Completed);
        turn.stop_reason = Some("max_tokens".to_string());
        assert_eq!(stop_reason_for(&turn), StopReason::MaxTokens);
    }

    #[test]
    fn test_should_compact_thresholds() {
        let thread = thread(ProviderKind::Anthropic);
        let pricing = pricing_for(ProviderKind::Anthropic, "claude-sonnet-4-20250514");
        thread.usage.lock().unwrap().record_turn(
            &TokenUsage {
                input_tokens: 150_000,
                output_tokens: 10_000,
                ..TokenUsage::default()
            },
            &pricing,
        );

        let mut options = SendOptions {
            compact_ratio: 0.8,
            ..SendOptions::default()
        };
        assert!(thread.should_compact(&options));
        options.compact_ratio = 0.9;
        assert!(!thread.should_compact(&options));
        options.compact_ratio = 1.5;
        assert!(!thread.should_compact(&options));
        options.compact_ratio = 0.5;
        options.disable_auto_compact = true;
        assert!(!thread.should_compact(&options));
    }

    #[test]
    fn test_aggregate_subagent_usage_skips_context_window() {
        let thread = thread(ProviderKind::Anthropic);
        let sub = Usage {
            input_tokens: 100,
            output_tokens: 50,
            input_cost: 0.5,
            current_context_window: 150,
            max_context_window: 200_000,
            ..Usage::default()
        };
        thread.aggregate_subagent_usage(&sub);
        thread.aggregate_subagent_usage(&sub);
        let usage = thread.get_usage();
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.output_tokens, 100);
        assert!((usage.input_cost - 1.0).abs() < 1e-9);
        assert_eq!(usage.current_context_window, 0);
        assert_eq!(usage.max_context_window, 0);
    }

    #[tokio::test]
    async fn test_save_merges_executions_across_saves() {
        let store = Arc::new(MemoryStore::default());
        let mut thread = thread(ProviderKind::Anthropic);
        thread.set_store(store.clone());
        seed_exchange(&mut thread);

        thread.add_tool_execution(0, execution("bash", "a"));
        thread.add_tool_execution(0, execution("read", "b"));
        thread.add_tool_execution(1, execution("grep", "c"));
        thread.save_conversation(false).await.unwrap();
        assert!(thread.pending_executions.is_empty());

        thread.summary = "Listing files".to_string();
        thread.save_conversation(false).await.unwrap();

        let record = store.load(thread.conversation_id()).await.unwrap().unwrap();
        assert_eq!(record.tool_executions_by_message[&0].len(), 2);
        assert_eq!(record.tool_executions_by_message[&1].len(), 1);
        assert_eq!(record.summary, "Listing files");
        assert_eq!(record.provider, "anthropic");
    }

    #[tokio::test]
    async fn test_save_keeps_executions_written_by_another_writer() {
        let store = Arc::new(MemoryStore::default());
        let mut thread = thread(ProviderKind::Anthropic);
        thread.set_store(store.clone());
        seed_exchange(&mut thread);

        let mut existing = ConversationRecord::new(thread.conversation_id(), "anthropic");
        existing.created_at = Utc::now() - chrono::Duration::days(2);
        existing
            .tool_executions_by_message
            .insert(0, vec![execution("bash", "old")]);
        store.save(&existing).await.unwrap();

        thread.add_tool_execution(0, execution("read", "new"));
        thread.save_conversation(false).await.unwrap();

        let record = store.load(thread.conversation_id()).await.unwrap().unwrap();
        let names: Vec<_> = record.tool_executions_by_message[&0]
            .iter()
            .map(|e| e.tool_name.as_str())
            .collect();
        assert_eq!(names, ["bash", "read"]);
        assert_eq!(record.created_at, existing.created_at);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_pending_executions() {
        let mut thread = thread(ProviderKind::Anthropic);
        thread.set_store(Arc::new(FailingStore));
        seed_exchange(&mut thread);
        thread.add_tool_execution(1, execution("bash", "a"));

        let err = thread.save_conversation(false).await.unwrap_err();
        assert!(matches!(err, ThreadError::Persistence(_)));
        assert_eq!(thread.pending_executions[&1].len(), 1);
        assert_eq!(thread.history().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_persistence_writes_nothing() {
        let store = Arc::new(MemoryStore::default());
        let mut thread = thread(ProviderKind::Anthropic);
        thread.set_store(store.clone());
        thread.set_persistence_enabled(false);
        seed_exchange(&mut thread);
        thread.save_conversation(false).await.unwrap();
        assert!(store.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_conversation_repairs_and_restores() {
        let store = Arc::new(MemoryStore::default());
        let mut record = ConversationRecord::new("conv-1", "openai");
        record.raw_messages = json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
            {"role": "assistant", "tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "bash", "arguments": "{}"}}
            ]}
        ]);
        record.summary = "Greeting".to_string();
        record.usage.input_tokens = 42;
        store.save(&record).await.unwrap();

        let mut thread = thread(ProviderKind::OpenAiChat);
        thread.set_store(store.clone());
        thread.load_conversation("conv-1").await.unwrap();
        assert_eq!(thread.history().len(), 2);
        assert_eq!(thread.conversation_id(), "conv-1");
        assert_eq!(thread.summary(), "Greeting");
        assert_eq!(thread.get_usage().input_tokens, 42);

        let mut other = self::thread(ProviderKind::Anthropic);
        other.set_store(store);
        let err = other.load_conversation("conv-1").await.unwrap_err();
        assert!(matches!(err, ThreadError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let mut thread = thread(ProviderKind::Anthropic);
        let handler = StringCollectorHandler::new(true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = thread
            .send_message("hi", &handler, &SendOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(thread.history().len(), 1);
    }

    #[tokio::test]
    async fn test_no_save_restores_history() {
        let mut thread = thread(ProviderKind::Anthropic);
        let handler = StringCollectorHandler::new(true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = SendOptions {
            no_save_conversation: true,
            ..SendOptions::default()
        };
        let _ = thread.send_message("hi", &handler, &options, &cancel).await;
        assert!(thread.history().is_empty());
    }
}
