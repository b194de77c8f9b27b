//! Stateless "chat completions" dialect, streamed or not

use std::collections::{BTreeMap, HashSet};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::agent::message::{ConversationMessage, Role, ToolCall};
use crate::agent::state::ConversationState;
use crate::error::Error;
use crate::tools::ToolDefinition;
use crate::Result;

use super::{
    arguments_string, error_message, first_str, image_data_url, responses, synthesize_call_id,
    OutputEvent, ParsedResponse, RequestOptions, TerminalStatus, IMAGE_CAPTION,
};

/// Serialize calls as a chat `tool_calls` array, stored on the assistant message.
pub fn encode_tool_calls(calls: &[ToolCall]) -> String {
    let encoded: Vec<Value> = calls.iter()
        .map(|call| json!({
            "id": call.id,
            "type": "function",
            "function": {"name": call.name, "arguments": call.arguments}
        }))
        .collect();
    Value::Array(encoded).to_string()
}

/// Stored `tool_calls` limited to answered calls; None if nothing valid remains.
fn replayable_tool_calls(
    message: &ConversationMessage,
    answered: &HashSet<&str>,
) -> Option<Vec<Value>> {
    let payload = message.tool_calls_payload.as_deref()?;
    let calls: Vec<Value> = serde_json::from_str::<Value>(payload).ok()?
        .as_array()?
        .clone();

    let well_formed = calls.iter().all(|call| {
        call.get("id").and_then(Value::as_str).is_some()
            && call.pointer("/function/name").and_then(Value::as_str).is_some()
    });
    if calls.is_empty() || !well_formed {
        return None;
    }

    let replayable: Vec<Value> = calls.into_iter()
        .filter(|call| {
            call.get("id").and_then(Value::as_str).is_some_and(|id| answered.contains(id))
        })
        .collect();
    (!replayable.is_empty()).then_some(replayable)
}

pub(super) fn build(
    state: &ConversationState,
    pending_images: &[Vec<u8>],
    tools: &[ToolDefinition],
    options: &RequestOptions<'_>,
) -> Value {
    let history = state.messages();
    let answered: HashSet<&str> = history.iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    let mut messages: Vec<Value> = Vec::with_capacity(history.len() + 1);
    // Calls of the assistant message the following tool results may answer
    let mut open_calls: HashSet<String> = HashSet::new();

    for message in history {
        let content = message.wire_content(options.policy_hints);
        match message.role {
            Role::Assistant if message.requested_tools() => {
                match replayable_tool_calls(message, &answered) {
                    Some(calls) => {
                        open_calls = calls.iter()
                            .filter_map(|c| c.get("id").and_then(Value::as_str).map(str::to_string))
                            .collect();
                        messages.push(json!({
                            "role": "assistant",
                            "content": content,
                            "tool_calls": calls
                        }));
                    }
                    None => {
                        warn!(
                            "Dropping assistant message with unusable tool call payload (calls: {:?})",
                            message.tool_call_ids
                        );
                        open_calls.clear();
                    }
                }
            }
            Role::Tool => {
                let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                if open_calls.contains(call_id) {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": call_id,
                        "content": content
                    }));
                } else {
                    warn!("Dropping tool result '{}' without a replayable tool call", call_id);
                }
            }
            role => {
                open_calls.clear();
                messages.push(json!({"role": role.as_str(), "content": content}));
            }
        }
    }

    if !pending_images.is_empty() {
        attach_images(&mut messages, pending_images);
    }

    let mut body = json!({
        "model": options.model,
        "messages": messages,
        "stream": true
    });

    let functions: Vec<Value> = tools.iter()
        .filter(|tool| tool.hosted.is_none())
        .map(|tool| json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters
            }
        }))
        .collect();
    if !functions.is_empty() {
        body["tools"] = Value::Array(functions);
    }

    body
}

fn attach_images(messages: &mut Vec<Value>, images: &[Vec<u8>]) {
    let image_parts = images.iter()
        .map(|bytes| json!({"type": "image_url", "image_url": {"url": image_data_url(bytes)}}));

    match messages.last_mut() {
        Some(last) if last.get("role").and_then(Value::as_str) == Some("user") => {
            let text = last.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
            let mut parts = vec![json!({"type": "text", "text": text})];
            parts.extend(image_parts);
            last["content"] = Value::Array(parts);
        }
        _ => {
            let mut parts = vec![json!({"type": "text", "text": IMAGE_CAPTION})];
            parts.extend(image_parts);
            messages.push(json!({"role": "user", "content": parts}));
        }
    }
}

/// Parse a non-streamed chat completion.
pub(super) fn parse_completion(value: &Value) -> Result<ParsedResponse> {
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return Ok(failed(error_message(error)));
    }

    let message = value.pointer("/choices/0/message")
        .ok_or_else(|| Error::Protocol("Chat completion has no message".to_string()))?;

    let mut events = Vec::new();

    if let Some(reasoning) = first_str(message, &["reasoning_content", "reasoning"]) {
        events.push(OutputEvent::ReasoningUpdate(reasoning.to_string()));
    }

    match message.get("content") {
        Some(Value::String(text)) if !text.is_empty() => {
            events.push(OutputEvent::TextDelta(text.clone()));
        }
        Some(Value::Array(parts)) => {
            for text in parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)) {
                events.push(OutputEvent::TextDelta(text.to_string()));
            }
        }
        _ => {}
    }

    for call in message.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
        let name = call.pointer("/function/name").and_then(Value::as_str);
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            warn!("Dropping tool call without a name");
            continue;
        };
        let id = first_str(call, &["id"])
            .map(str::to_string)
            .unwrap_or_else(synthesize_call_id);
        events.push(OutputEvent::ToolCallRequested(ToolCall::new(
            id,
            name,
            arguments_string(call.pointer("/function/arguments")),
        )));
    }

    events.push(OutputEvent::ResponseTerminal(TerminalStatus::Completed));
    Ok(ParsedResponse { events, continuation_token: None })
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Parse a server-sent event stream.
///
/// Chat chunks are accumulated (tool call fragments by index); a
/// `response.*` terminal event from the stateful dialect is parsed as that
/// dialect's response object.
pub(super) fn parse_stream(body: &str) -> Result<ParsedResponse> {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut calls: BTreeMap<u64, PartialCall> = BTreeMap::new();
    let mut chunks = 0usize;
    let mut stream_error = None;

    for line in body.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            break;
        }
        if data.is_empty() {
            continue;
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Skipping malformed stream chunk: {}", e);
                continue;
            }
        };
        chunks += 1;

        if let Some(event_type) = chunk.get("type").and_then(Value::as_str) {
            if matches!(
                event_type,
                "response.completed" | "response.failed" | "response.incomplete"
            ) {
                if let Some(response) = chunk.get("response") {
                    debug!("Stream carries a responses object; parsing it directly");
                    return responses::parse(response);
                }
            }
        }

        if let Some(error) = chunk.get("error").filter(|e| !e.is_null()) {
            stream_error = Some(error_message(error));
            continue;
        }

        let Some(delta) = chunk.pointer("/choices/0/delta") else {
            continue;
        };

        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            text.push_str(content);
        }
        if let Some(thought) = first_str(delta, &["reasoning_content", "reasoning"]) {
            reasoning.push_str(thought);
        }

        let fragments = delta.get("tool_calls").and_then(Value::as_array).into_iter().flatten();
        for (position, fragment) in fragments.enumerate() {
            let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(position as u64);
            let partial = calls.entry(index).or_default();
            if let Some(id) = first_str(fragment, &["id"]) {
                partial.id = id.to_string();
            }
            let name = fragment.pointer("/function/name").and_then(Value::as_str);
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                partial.name = name.to_string();
            }
            let arguments = fragment.pointer("/function/arguments").and_then(Value::as_str);
            if let Some(arguments) = arguments {
                partial.arguments.push_str(arguments);
            }
        }
    }

    if chunks == 0 {
        return Err(Error::Protocol("Event stream contained no data".to_string()));
    }

    if let Some(message) = stream_error {
        return Ok(failed(message));
    }

    let mut events = Vec::new();
    if !reasoning.is_empty() {
        events.push(OutputEvent::ReasoningUpdate(reasoning));
    }
    if !text.is_empty() {
        events.push(OutputEvent::TextDelta(text));
    }
    for partial in calls.into_values() {
        if partial.name.is_empty() {
            warn!("Dropping streamed tool call without a name");
            continue;
        }
        let id = if partial.id.is_empty() { synthesize_call_id() } else { partial.id };
        let arguments = if partial.arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            partial.arguments
        };
        events.push(OutputEvent::ToolCallRequested(ToolCall::new(id, partial.name, arguments)));
    }
    events.push(OutputEvent::ResponseTerminal(TerminalStatus::Completed));

    Ok(ParsedResponse { events, continuation_token: None })
}

fn failed(message: String) -> ParsedResponse {
    ParsedResponse {
        events: vec![OutputEvent::ResponseTerminal(TerminalStatus::Failed(message))],
        continuation_token: None,
    }
}
