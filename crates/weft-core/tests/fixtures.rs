//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use weft_core::config::{Config, RetryConfig};
use weft_core::core::{MessageHandler, ToolDispatcher};
use weft_core::providers::ProviderKind;
use weft_core::tools::{ToolDefinition, ToolOutput, ToolRegistry};
use wiremock::ResponseTemplate;

pub const ANTHROPIC_TEXT: &str = include_str!("fixtures/anthropic_text.sse");
pub const ANTHROPIC_TOOL_USE: &str = include_str!("fixtures/anthropic_tool_use.sse");
pub const CHAT_TEXT: &str = include_str!("fixtures/chat_text.sse");
pub const CHAT_TOOL_USE: &str = include_str!("fixtures/chat_tool_use.sse");
pub const RESPONSES_TEXT: &str = include_str!("fixtures/responses_text.sse");
pub const RESPONSES_TOOL_USE: &str = include_str!("fixtures/responses_tool_use.sse");

pub const READ_OUTPUT: &str = "contents_of_notes_txt";

/// Endpoint path and SSE templates for one backend.
pub struct Backend {
    pub kind: ProviderKind,
    pub path: &'static str,
    text: &'static str,
    tool_use: &'static str,
}

pub const BACKENDS: [Backend; 3] = [
    Backend {
        kind: ProviderKind::Anthropic,
        path: "/v1/messages",
        text: ANTHROPIC_TEXT,
        tool_use: ANTHROPIC_TOOL_USE,
    },
    Backend {
        kind: ProviderKind::OpenAiChat,
        path: "/v1/chat/completions",
        text: CHAT_TEXT,
        tool_use: CHAT_TOOL_USE,
    },
    Backend {
        kind: ProviderKind::OpenAiResponses,
        path: "/v1/responses",
        text: RESPONSES_TEXT,
        tool_use: RESPONSES_TOOL_USE,
    },
];

impl Backend {
    pub fn text_sse(&self, text: &str) -> String {
        self.text.replace("{{TEXT}}", &escape_json(text))
    }

    pub fn tool_use_sse(&self, tool_id: &str, tool_name: &str, input_json: &str) -> String {
        self.tool_use
            .replace("{{TOOL_ID}}", tool_id)
            .replace("{{TOOL_NAME}}", tool_name)
            .replace("{{INPUT_JSON}}", &escape_json(input_json))
    }

    /// Config pointing this backend at the mock server. The endpoint is
    /// injected so `*_BASE_URL` in the environment cannot redirect it.
    pub fn config(&self, server_uri: &str, conversations_dir: &Path) -> Config {
        let mut config = Config {
            provider: Some(self.kind.id().to_string()),
            model: match self.kind {
                ProviderKind::Anthropic => "claude-sonnet-4-20250514".to_string(),
                _ => "gpt-4.1".to_string(),
            },
            retry: RetryConfig::none(),
            conversations_dir: Some(conversations_dir.to_path_buf()),
            ..Config::default()
        };
        if self.kind == ProviderKind::OpenAiResponses {
            config.openai_api_mode = weft_core::providers::OpenAiApiMode::Responses;
        }
        config.providers.anthropic.api_key = Some("test-api-key".to_string());
        config.providers.anthropic.endpoint = Some(server_uri.to_string());
        config.providers.openai.api_key = Some("test-api-key".to_string());
        config.providers.openai.endpoint = Some(format!("{server_uri}/v1"));
        config
    }
}

/// Wrap SSE body string in a `ResponseTemplate`.
pub fn sse_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body.to_string())
}

/// A `read` tool that always returns [`READ_OUTPUT`].
pub fn read_tools() -> ToolDispatcher {
    let mut registry = ToolRegistry::new();
    registry.register_blocking(
        ToolDefinition {
            name: "read".to_string(),
            description: "Read a file".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        },
        |input, _ctx| {
            let path = input["path"].as_str().unwrap_or_default();
            ToolOutput::success("read", READ_OUTPUT).with_user_facing(format!("Read {path}"))
        },
    );
    ToolDispatcher::new(registry)
}

pub fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Records callbacks for assertions.
#[derive(Default)]
pub struct RecordingHandler {
    pub done: AtomicUsize,
    pub texts: Mutex<Vec<String>>,
    pub tool_uses: Mutex<Vec<(String, String)>>,
    pub tool_results: Mutex<Vec<(String, bool)>>,
}

impl RecordingHandler {
    pub fn done_count(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }
}

impl MessageHandler for RecordingHandler {
    fn handle_text(&self, text: &str) {
        self.texts.lock().unwrap().push(text.to_string());
    }

    fn handle_tool_use(&self, call_id: &str, name: &str, _input: &str) {
        self.tool_uses
            .lock()
            .unwrap()
            .push((call_id.to_string(), name.to_string()));
    }

    fn handle_tool_result(&self, call_id: &str, _name: &str, result: &ToolOutput) {
        self.tool_results
            .lock()
            .unwrap()
            .push((call_id.to_string(), result.is_success()));
    }

    fn handle_thinking(&self, _thinking: &str) {}

    fn handle_done(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

fn escape_json(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}
