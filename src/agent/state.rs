//! Conversation state owned by the loop controller

use std::collections::HashSet;

use tracing::debug;

use crate::error::Error;
use crate::tools::DispatchHeuristics;
use crate::Result;

use super::message::{ConversationMessage, Role};

/// Snapshot taken when a turn starts; restored if the turn fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    history_len: usize,
    continuation_token: Option<String>,
    sent_watermark: usize,
}

/// History, continuation token, counters and heuristics for one conversation.
#[derive(Debug, Default)]
pub struct ConversationState {
    messages: Vec<ConversationMessage>,
    continuation_token: Option<String>,
    iteration_count: usize,
    executed_signatures: HashSet<String>,
    heuristics: DispatchHeuristics,
    /// Messages before this index have been acknowledged by a stateful provider
    sent_watermark: usize,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message.
    ///
    /// A tool message must answer a call listed by an earlier assistant message.
    pub fn append(&mut self, message: ConversationMessage) -> Result<()> {
        if message.role == Role::Tool {
            let call_id = message.tool_call_id.as_deref().unwrap_or_default();
            let known = self.messages.iter().any(|m| {
                m.role == Role::Assistant && m.tool_call_ids.iter().any(|id| id == call_id)
            });
            if !known {
                return Err(Error::Protocol(format!(
                    "Tool result for unknown call '{}'",
                    call_id
                )));
            }
        }

        self.messages.push(message);
        Ok(())
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.continuation_token.as_deref()
    }

    pub fn set_continuation_token(&mut self, token: Option<String>) {
        self.continuation_token = token;
    }

    pub fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    /// Start a new user task: iterations, signatures and heuristics reset.
    pub fn begin_task(&mut self) {
        self.iteration_count = 0;
        self.executed_signatures.clear();
        self.heuristics.reset();
    }

    pub fn reset_iterations(&mut self) {
        self.iteration_count = 0;
    }

    /// Count one continuation and return the new total.
    pub fn increment_iterations(&mut self) -> usize {
        self.iteration_count += 1;
        self.iteration_count
    }

    /// Record a call signature; false if it was already recorded.
    pub fn record_signature(&mut self, signature: String) -> bool {
        self.executed_signatures.insert(signature)
    }

    pub fn heuristics(&self) -> &DispatchHeuristics {
        &self.heuristics
    }

    pub fn heuristics_mut(&mut self) -> &mut DispatchHeuristics {
        &mut self.heuristics
    }

    /// Messages the stateful provider has not seen yet.
    pub fn unsent(&self) -> &[ConversationMessage] {
        let start = self.sent_watermark.min(self.messages.len());
        &self.messages[start..]
    }

    /// Mark every current message as acknowledged.
    pub fn mark_sent(&mut self) {
        self.sent_watermark = self.messages.len();
    }

    /// Forget the provider-side conversation.
    pub fn start_fresh(&mut self) {
        self.continuation_token = None;
        self.sent_watermark = 0;
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            history_len: self.messages.len(),
            continuation_token: self.continuation_token.clone(),
            sent_watermark: self.sent_watermark,
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        debug!(
            "Restoring conversation to {} messages (was {})",
            checkpoint.history_len,
            self.messages.len()
        );
        self.messages.truncate(checkpoint.history_len);
        self.continuation_token = checkpoint.continuation_token;
        self.sent_watermark = checkpoint.sent_watermark;
        self.iteration_count = 0;
    }

    /// Reset everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
