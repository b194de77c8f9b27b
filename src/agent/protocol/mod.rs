//! Protocol adapter for the two provider wire dialects.
//!
//! - **Stateful** (`/responses`): requests carry only new input plus the
//!   provider's continuation token (`previous_response_id`).
//! - **Stateless** (`/chat/completions`): requests replay the whole history,
//!   including reconstructed `tool_calls` for every assistant message.
//!
//! Both dialects parse into the same [`OutputEvent`] list. Bodies arriving in
//! the other dialect's format (or as an event stream) are detected and
//! re-routed instead of failing.

mod chat;
mod responses;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;
use crate::tools::ToolDefinition;
use crate::Result;

use super::message::ToolCall;
use super::state::ConversationState;

pub use chat::encode_tool_calls;

/// Caption for the user item that carries images on a tool continuation
const IMAGE_CAPTION: &str = "Viewport image captured by the previous tool call.";

/// Wire dialect, derived once from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Stateful,
    Stateless,
}

impl ProviderMode {
    /// Endpoints whose path names the responses API are stateful.
    pub fn from_endpoint(url: &str) -> Self {
        if url.contains("/responses") {
            ProviderMode::Stateful
        } else {
            ProviderMode::Stateless
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Stateful => "stateful",
            ProviderMode::Stateless => "stateless",
        }
    }
}

/// How a response ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed(String),
    Cancelled,
}

impl TerminalStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, TerminalStatus::Completed)
    }
}

/// Normalized output of one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    TextDelta(String),
    ReasoningUpdate(String),
    ToolCallRequested(ToolCall),
    ResponseTerminal(TerminalStatus),
}

/// Parsed response: events plus the next continuation token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub events: Vec<OutputEvent>,
    pub continuation_token: Option<String>,
}

impl ParsedResponse {
    /// Terminal status; a response without one completed.
    pub fn status(&self) -> TerminalStatus {
        self.events.iter().rev()
            .find_map(|event| match event {
                OutputEvent::ResponseTerminal(status) => Some(status.clone()),
                _ => None,
            })
            .unwrap_or(TerminalStatus::Completed)
    }

    /// All text, concatenated
    pub fn text(&self) -> String {
        self.events.iter()
            .filter_map(|event| match event {
                OutputEvent::TextDelta(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn reasoning(&self) -> Vec<&str> {
        self.events.iter()
            .filter_map(|event| match event {
                OutputEvent::ReasoningUpdate(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.events.iter()
            .filter_map(|event| match event {
                OutputEvent::ToolCallRequested(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Request settings that do not live in the conversation state
#[derive(Debug, Clone, Copy)]
pub struct RequestOptions<'a> {
    pub model: &'a str,
    /// Agent instructions (stateful dialect only)
    pub instructions: &'a str,
    /// Ask for reasoning summaries on reasoning models
    pub reasoning_summary: bool,
    /// Render policy hints into tool result content
    pub policy_hints: bool,
}

/// Build the request body for the next call.
///
/// The pending user text is expected to be in `state` already; `pending_images`
/// are attached to the trailing user input, or to a new one on continuations.
pub fn build_request(
    state: &ConversationState,
    pending_images: &[Vec<u8>],
    tools: &[ToolDefinition],
    mode: ProviderMode,
    options: &RequestOptions<'_>,
) -> Value {
    match mode {
        ProviderMode::Stateful => responses::build(state, pending_images, tools, options),
        ProviderMode::Stateless => chat::build(state, pending_images, tools, options),
    }
}

/// Parse a successful response body.
pub fn parse_response(body: &str, mode: ProviderMode) -> Result<ParsedResponse> {
    if looks_like_event_stream(body) {
        debug!("Response is an event stream; parsing as stream ({} mode)", mode.as_str());
        return chat::parse_stream(body);
    }

    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) if body.contains("data: ") => {
            warn!("Response is not JSON but contains stream data; re-routing");
            return chat::parse_stream(body);
        }
        Err(e) => return Err(Error::Protocol(format!("Malformed response JSON: {}", e))),
    };

    if value.get("choices").is_some() {
        if mode == ProviderMode::Stateful {
            warn!("Stateful endpoint returned a chat completion; re-routing");
        }
        return chat::parse_completion(&value);
    }

    if value.get("output").is_some()
        || value.get("object").and_then(Value::as_str) == Some("response")
    {
        if mode == ProviderMode::Stateless {
            warn!("Stateless endpoint returned a responses object; re-routing");
        }
        return responses::parse(&value);
    }

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let status = TerminalStatus::Failed(error_message(error));
        return Ok(ParsedResponse {
            events: vec![OutputEvent::ResponseTerminal(status)],
            continuation_token: None,
        });
    }

    Err(Error::Protocol("Response has neither 'output' nor 'choices'".to_string()))
}

/// The provider rejected `reasoning.summary` for this account or model.
pub fn is_reasoning_summary_unsupported(status: u16, body: &str) -> bool {
    if status != 400 {
        return false;
    }

    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    let error = value.get("error");
    let field = |key: &str| error.and_then(|e| e.get(key)).and_then(Value::as_str);
    field("param") == Some("reasoning.summary") && field("code") == Some("unsupported_value")
}

/// Remove `reasoning.summary` from a request body; false if it was absent.
pub fn strip_reasoning_summary(body: &mut Value) -> bool {
    body.get_mut("reasoning")
        .and_then(Value::as_object_mut)
        .map(|reasoning| reasoning.remove("summary").is_some())
        .unwrap_or(false)
}

/// Models that accept the `reasoning` block.
pub fn supports_reasoning(model: &str) -> bool {
    let model = model.to_lowercase();
    ["gpt-5", "o1", "o3"].iter().any(|family| model.contains(family))
}

fn looks_like_event_stream(body: &str) -> bool {
    let trimmed = body.trim_start();
    trimmed.starts_with("data:") || trimmed.starts_with("event:")
}

fn image_data_url(bytes: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(bytes))
}

fn error_message(error: &Value) -> String {
    error.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| error.as_str().map(str::to_string))
        .unwrap_or_else(|| error.to_string())
}

/// First string found under any of `keys`.
fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

/// Arguments as a JSON string, whether sent as a string or an object.
fn arguments_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Null) | Some(Value::String(_)) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    }
}

fn synthesize_call_id() -> String {
    let id = format!("call_{}", uuid::Uuid::new_v4().simple());
    warn!("Tool call without id; using {}", id);
    id
}
