//! Agent module - core agent logic.
//!
//! This module contains:
//! - Message and conversation state types
//! - Protocol adapter for the stateful and stateless wire dialects
//! - Loop controller (the turn state machine)
//! - Agent client actor and HTTP transport
//! - Context builder for the agent instructions

mod client;
mod context;
mod controller;
mod event;
mod message;
pub mod protocol;
mod state;
pub mod transport;

pub use client::{AgentClient, AgentHandle};
pub use context::Context;
pub use controller::{ControllerConfig, LoopController, Outbound, Phase, Step, ToolPlan};
pub use event::{AgentEvent, TurnOutcome};
pub use message::{ConversationMessage, Role, ToolCall};
pub use protocol::{OutputEvent, ParsedResponse, ProviderMode, TerminalStatus};
pub use state::{Checkpoint, ConversationState};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
