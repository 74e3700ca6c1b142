//! Running token and cost totals for one thread.

use serde::{Deserialize, Serialize};

use super::pricing::ModelPricing;
use crate::providers::TokenUsage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    /// Prompt plus output of the most recent exchange
    pub current_context_window: u64,
    pub max_context_window: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn total_cost(&self) -> f64 {
        self.input_cost + self.output_cost + self.cache_creation_cost + self.cache_read_cost
    }

    /// Adds one exchange's usage. Costs accumulate; nothing is rescaled.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_turn(&mut self, turn: &TokenUsage, pricing: &ModelPricing) {
        let non_cached = turn
            .input_tokens
            .saturating_sub(turn.cached_input_tokens)
            .saturating_sub(turn.cache_creation_input_tokens);

        self.input_tokens += turn.input_tokens;
        self.output_tokens += turn.output_tokens;
        self.cache_read_input_tokens += turn.cached_input_tokens;
        self.cache_creation_input_tokens += turn.cache_creation_input_tokens;

        self.input_cost += non_cached as f64 * pricing.input;
        self.cache_read_cost += turn.cached_input_tokens as f64 * pricing.cached_input;
        self.cache_creation_cost += turn.cache_creation_input_tokens as f64 * pricing.cache_write;
        self.output_cost += turn.output_tokens as f64 * pricing.output;

        self.current_context_window = turn.input_tokens + turn.output_tokens;
        self.max_context_window = pricing.context_window;
    }

    /// Folds a finished sub-agent's totals in. Context window fields belong
    /// to this thread and are left alone.
    pub fn add_subagent(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.input_cost += other.input_cost;
        self.output_cost += other.output_cost;
        self.cache_creation_cost += other.cache_creation_cost;
        self.cache_read_cost += other.cache_read_cost;
    }

    /// Fraction of the context window used by the last exchange.
    #[allow(clippy::cast_precision_loss)]
    pub fn context_ratio(&self) -> Option<f64> {
        (self.max_context_window > 0)
            .then(|| self.current_context_window as f64 / self.max_context_window as f64)
    }
}
