//! Notifications emitted to observers

use super::message::Role;

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Final text delivered
    Completed,
    /// Response had neither text nor tool calls
    NoContent,
    /// Only provider-executed tools ran; the provider continues on its own
    ServerHandled,
    /// Iteration cap reached; the user may resume
    LoopLimit { max: usize },
    Failed(String),
    Cancelled,
}

/// Observer notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Message for display, with the tool calls it requested
    Message {
        role: Role,
        content: String,
        tool_call_ids: Vec<String>,
    },
    /// Reasoning summary update
    Reasoning(String),
    /// A tool call started (or, for hosted tools, was observed)
    ToolCall { name: String, arguments: String },
    /// Full, untruncated tool output
    ToolResult { call_id: String, result: String },
    TurnFinished(TurnOutcome),
}
