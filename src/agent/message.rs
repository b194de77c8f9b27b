//! Message types for agent communication

use serde::{Deserialize, Serialize};

use crate::tools::PolicyHint;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,

    /// Calls requested by an assistant message, in the order the provider listed them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_ids: Vec<String>,

    /// Call answered by a tool message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Serialized `tool_calls` array, replayed verbatim to stateless providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls_payload: Option<String>,

    /// Control instructions rendered after the content when the message goes on the wire
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_hints: Vec<PolicyHint>,
}

impl ConversationMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_ids: Vec::new(),
            tool_call_id: None,
            tool_calls_payload: None,
            policy_hints: Vec::new(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message that requested tools
    pub fn assistant_with_tools(
        content: impl Into<String>,
        tool_call_ids: Vec<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_ids,
            tool_calls_payload: Some(payload.into()),
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Create a tool result message
    pub fn tool_result(call_id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, result)
        }
    }

    /// Attach control instructions
    pub fn with_hints(mut self, hints: Vec<PolicyHint>) -> Self {
        self.policy_hints = hints;
        self
    }

    pub fn requested_tools(&self) -> bool {
        self.role == Role::Assistant && !self.tool_call_ids.is_empty()
    }

    /// Content as sent to the provider, optionally followed by policy hints.
    pub fn wire_content(&self, with_hints: bool) -> String {
        if !with_hints || self.policy_hints.is_empty() {
            return self.content.clone();
        }

        let mut rendered = self.content.clone();
        for hint in &self.policy_hints {
            rendered.push_str("\n\n");
            rendered.push_str(hint.instruction());
        }
        rendered
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw, unvalidated JSON arguments
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}
