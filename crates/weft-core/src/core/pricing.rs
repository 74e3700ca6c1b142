//! Per-model token pricing (USD per token) and context window sizes.

use crate::providers::ProviderKind;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub cached_input: f64,
    /// Anthropic prompt-cache writes; zero elsewhere
    pub cache_write: f64,
    pub output: f64,
    pub context_window: u64,
}

impl ModelPricing {
    const fn new(
        input: f64,
        cached_input: f64,
        cache_write: f64,
        output: f64,
        context_window: u64,
    ) -> Self {
        Self {
            input,
            cached_input,
            cache_write,
            output,
            context_window,
        }
    }
}

const SONNET_4: ModelPricing = ModelPricing::new(3e-6, 3e-7, 3.75e-6, 15e-6, 200_000);
const OPUS_4: ModelPricing = ModelPricing::new(15e-6, 1.5e-6, 18.75e-6, 75e-6, 200_000);
const HAIKU_3_5: ModelPricing = ModelPricing::new(8e-7, 8e-8, 1e-6, 4e-6, 200_000);

const ANTHROPIC_MODELS: &[(&str, ModelPricing)] = &[
    ("claude-sonnet-4-20250514", SONNET_4),
    ("claude-sonnet-4-5", SONNET_4),
    ("claude-3-7-sonnet-latest", SONNET_4),
    ("claude-opus-4-20250514", OPUS_4),
    ("claude-opus-4-1-20250805", OPUS_4),
    ("claude-3-5-haiku-latest", HAIKU_3_5),
    ("claude-3-5-haiku-20241022", HAIKU_3_5),
];

/// Ordered longest prefix first so `gpt-4.1-mini` never matches `gpt-4.1`.
const OPENAI_MODELS: &[(&str, ModelPricing)] = &[
    ("gpt-4.1-mini", ModelPricing::new(4e-7, 1e-7, 0.0, 1.6e-6, 1_047_576)),
    ("gpt-4.1", ModelPricing::new(2e-6, 5e-7, 0.0, 8e-6, 1_047_576)),
    ("gpt-4o-mini", ModelPricing::new(1.5e-7, 7.5e-8, 0.0, 6e-7, 128_000)),
    ("gpt-4o", ModelPricing::new(2.5e-6, 1.25e-6, 0.0, 1e-5, 128_000)),
    ("o4-mini", ModelPricing::new(1.1e-6, 2.75e-7, 0.0, 4.4e-6, 200_000)),
    ("o3", ModelPricing::new(2e-6, 5e-7, 0.0, 8e-6, 200_000)),
];

/// Looks up pricing for a model. Unknown models price at zero.
pub fn pricing_for(provider: ProviderKind, model: &str) -> ModelPricing {
    let model = model.trim().to_lowercase();
    match provider {
        ProviderKind::Anthropic => anthropic_pricing(&model),
        ProviderKind::OpenAiChat | ProviderKind::OpenAiResponses => OPENAI_MODELS
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
            .map(|(_, pricing)| *pricing)
            .unwrap_or_default(),
    }
}

fn anthropic_pricing(model: &str) -> ModelPricing {
    if let Some((_, pricing)) = ANTHROPIC_MODELS.iter().find(|(name, _)| *name == model) {
        return *pricing;
    }
    // Family fallback
    if model.contains("opus") {
        OPUS_4
    } else if model.contains("haiku") {
        HAIKU_3_5
    } else if model.contains("sonnet") {
        SONNET_4
    } else {
        ModelPricing::default()
    }
}
