//! Prompt templates.

use anyhow::{Context, Result};
use chrono::Utc;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::providers::ProviderKind;
use crate::tools::ToolDefinition;

/// System prompt template (`MiniJinja`).
pub const SYSTEM_PROMPT_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/system_prompt.md"
));

/// Asks the model to replace the history with a working summary.
pub const COMPACT_PROMPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/compact_prompt.md"
));

/// Asks the weak model for a one-line conversation title.
pub const SUMMARY_PROMPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/summary_prompt.md"
));

#[derive(Debug, Serialize)]
struct PromptTool<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct SystemPromptVars<'a> {
    provider: &'a str,
    model: &'a str,
    cwd: String,
    date: String,
    is_sub_agent: bool,
    tool_term: &'static str,
    tool_term_plural: &'static str,
    tools: Vec<PromptTool<'a>>,
}

/// Renders the system prompt for a thread.
///
/// # Errors
/// Returns an error if the template fails to render.
pub fn render_system_prompt(
    provider: ProviderKind,
    model: &str,
    tools: &[ToolDefinition],
    is_sub_agent: bool,
) -> Result<String> {
    let vars = SystemPromptVars {
        provider: provider.id(),
        model,
        cwd: std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        date: Utc::now().format("%Y-%m-%d").to_string(),
        is_sub_agent,
        // OpenAI models are trained on "functions"
        tool_term: if provider.is_openai() { "function" } else { "tool" },
        tool_term_plural: if provider.is_openai() {
            "functions"
        } else {
            "tools"
        },
        tools: tools
            .iter()
            .map(|t| PromptTool {
                name: &t.name,
                description: t.description.lines().next().unwrap_or_default(),
            })
            .collect(),
    };

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .context("Invalid system prompt template")?;
    let output = env
        .get_template("system_prompt")
        .and_then(|t| t.render(&vars))
        .context("Failed to render system prompt")?;
    Ok(output.replace("\r\n", "\n").trim().to_string())
}
