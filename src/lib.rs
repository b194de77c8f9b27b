//! EditorGPT - agentic LLM client for a 3D editor
//!
//! This library provides the agent loop that talks to a stateful
//! ("responses") or stateless ("chat completions") provider, dispatches the
//! editor tools the model asks for, and keeps the conversation consistent
//! across round-trips.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod scene;
pub mod tools;
pub mod ui;

pub use error::{Error, Result};
