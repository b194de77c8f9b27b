//! Stateful "responses" dialect

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::agent::message::{Role, ToolCall};
use crate::agent::state::ConversationState;
use crate::error::Error;
use crate::tools::ToolDefinition;
use crate::Result;

use super::{
    arguments_string, error_message, first_str, image_data_url, supports_reasoning,
    synthesize_call_id, OutputEvent, ParsedResponse, RequestOptions, TerminalStatus, IMAGE_CAPTION,
};

pub(super) fn build(
    state: &ConversationState,
    pending_images: &[Vec<u8>],
    tools: &[ToolDefinition],
    options: &RequestOptions<'_>,
) -> Value {
    let mut input: Vec<Value> = Vec::new();

    // The provider already holds assistant turns and their tool calls
    for message in state.unsent() {
        let content = message.wire_content(options.policy_hints);
        match message.role {
            Role::User | Role::System => {
                input.push(json!({"role": message.role.as_str(), "content": content}));
            }
            Role::Tool => match &message.tool_call_id {
                Some(call_id) => input.push(json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": content
                })),
                None => warn!("Skipping tool message without call id"),
            },
            Role::Assistant => debug!("Skipping assistant message (held by provider)"),
        }
    }

    if !pending_images.is_empty() {
        attach_images(&mut input, pending_images);
    }

    let mut body = json!({
        "model": options.model,
        "input": input,
        "text": {"verbosity": "low"},
        "stream": false
    });

    if !options.instructions.is_empty() {
        body["instructions"] = json!(options.instructions);
    }

    if supports_reasoning(options.model) {
        let mut reasoning = json!({"effort": "low"});
        if options.reasoning_summary {
            reasoning["summary"] = json!("auto");
        }
        body["reasoning"] = reasoning;
    }

    if let Some(token) = state.continuation_token() {
        body["previous_response_id"] = json!(token);
    }

    if !tools.is_empty() {
        let declared: Vec<Value> = tools.iter()
            .map(|tool| match &tool.hosted {
                Some(hosted) => hosted.clone(),
                None => json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }),
            })
            .collect();
        body["tools"] = Value::Array(declared);
    }

    body
}

fn attach_images(input: &mut Vec<Value>, images: &[Vec<u8>]) {
    let image_parts = images.iter()
        .map(|bytes| json!({"type": "input_image", "image_url": image_data_url(bytes)}));

    match input.last_mut() {
        Some(last) if last.get("role").and_then(Value::as_str) == Some("user") => {
            let text = last.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
            let mut parts = vec![json!({"type": "input_text", "text": text})];
            parts.extend(image_parts);
            last["content"] = Value::Array(parts);
        }
        _ => {
            let mut parts = vec![json!({"type": "input_text", "text": IMAGE_CAPTION})];
            parts.extend(image_parts);
            input.push(json!({"role": "user", "content": parts}));
        }
    }
}

pub(super) fn parse(value: &Value) -> Result<ParsedResponse> {
    let continuation_token = value.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let status = match value.get("status").and_then(Value::as_str) {
        Some("failed") => TerminalStatus::Failed(
            value.get("error")
                .filter(|e| !e.is_null())
                .map(error_message)
                .unwrap_or_else(|| "response failed".to_string()),
        ),
        Some("cancelled") | Some("canceled") => TerminalStatus::Cancelled,
        _ => TerminalStatus::Completed,
    };

    let mut events = Vec::new();

    if let Some(summary) = value.pointer("/reasoning/summary").and_then(Value::as_str) {
        if !summary.is_empty() {
            events.push(OutputEvent::ReasoningUpdate(summary.to_string()));
        }
    }

    match value.get("output").and_then(Value::as_array) {
        Some(items) => {
            for item in items {
                parse_item(item, &mut events);
            }
        }
        None if !status.is_failure() => {
            return Err(Error::Protocol("Response has no output array".to_string()));
        }
        None => {}
    }

    events.push(OutputEvent::ResponseTerminal(status));
    Ok(ParsedResponse { events, continuation_token })
}

fn parse_item(item: &Value, events: &mut Vec<OutputEvent>) {
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
    match item_type {
        "function_call" => {
            if let Some(call) = function_call(item) {
                events.push(OutputEvent::ToolCallRequested(call));
            }
        }
        "web_search_call" | "file_search_call" => {
            let name = item_type.trim_end_matches("_call");
            let id = first_str(item, &["id", "call_id"])
                .map(str::to_string)
                .unwrap_or_else(synthesize_call_id);
            events.push(OutputEvent::ToolCallRequested(ToolCall::new(
                id,
                name,
                search_arguments(item, item_type),
            )));
        }
        "message" => {
            let Some(parts) = item.get("content").and_then(Value::as_array) else {
                debug!("Message item without content array");
                return;
            };
            for part in parts {
                match part.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "output_text" | "text" => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            events.push(OutputEvent::TextDelta(text.to_string()));
                        }
                    }
                    "reasoning" | "thought" => {
                        if let Some(text) = first_str(part, &["text", "summary"]) {
                            events.push(OutputEvent::ReasoningUpdate(text.to_string()));
                        }
                    }
                    "tool_call" => {
                        if let Some(call) = part.get("tool_call").and_then(function_call) {
                            events.push(OutputEvent::ToolCallRequested(call));
                        }
                    }
                    other => debug!("Ignoring message content part '{}'", other),
                }
            }
        }
        "reasoning" => {
            let summary: Vec<&str> = item.get("summary")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).collect()
                })
                .unwrap_or_default();
            if !summary.is_empty() {
                events.push(OutputEvent::ReasoningUpdate(summary.join("\n\n")));
            }
        }
        other => debug!("Ignoring output item '{}'", other),
    }
}

/// Function call from an output item, tolerating the key variants seen across API versions.
fn function_call(item: &Value) -> Option<ToolCall> {
    let nested = item.get("function");

    let name = nested
        .and_then(|f| first_str(f, &["name"]))
        .or_else(|| first_str(item, &["name", "function_name"]));
    let Some(name) = name else {
        warn!("Dropping function call without a name");
        return None;
    };

    let arguments = nested
        .and_then(|f| f.get("arguments"))
        .or_else(|| item.get("arguments"))
        .or_else(|| item.get("function_arguments"));

    let id = first_str(item, &["call_id", "id", "function_call_id"])
        .map(str::to_string)
        .unwrap_or_else(synthesize_call_id);

    Some(ToolCall::new(id, name, arguments_string(arguments)))
}

/// Compact arguments for a hosted search call, for observers only.
fn search_arguments(item: &Value, item_type: &str) -> String {
    let nested = item.get(item_type).or_else(|| item.get("action"));

    let query = first_str(item, &["query"])
        .map(str::to_string)
        .or_else(|| nested.and_then(|n| first_str(n, &["query"])).map(str::to_string))
        .or_else(|| {
            item.get("queries")
                .and_then(Value::as_array)
                .map(|queries| {
                    queries.iter().filter_map(Value::as_str).collect::<Vec<_>>().join("; ")
                })
                .filter(|joined| !joined.is_empty())
        });

    let mut arguments = Map::new();
    if let Some(query) = query {
        arguments.insert("query".to_string(), Value::String(query));
    } else if let Some(raw) = item.get("arguments") {
        return arguments_string(Some(raw));
    }
    Value::Object(arguments).to_string()
}
