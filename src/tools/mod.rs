//! Tools module - agent capabilities
//!
//! Tools are the actions the agent can take against the editor: running
//! scripts, querying the scene, capturing the viewport, generating content,
//! and the provider-hosted searches it only observes.

mod registry;
mod result;
mod policy;
mod python;
mod scene;
mod generate;
mod hosted;

pub use registry::{parse_arguments, ToolRegistry, ToolDefinition};
pub use result::{truncate_for_history, PolicyHint, ToolResult};
pub use policy::{call_signature, DispatchHeuristics, RepeatPolicy};
pub use python::{build_wrapper, ProcessRuntime, PythonExecuteTool, ScriptOutput, ScriptRuntime};
pub use scene::{ReflectionQueryTool, SceneQueryTool, ViewportScreenshotTool};
pub use generate::ReplicateTool;
pub use hosted::{FileSearchTool, WebSearchTool};

use async_trait::async_trait;
use serde_json::Value;
use crate::Result;

/// Where and how a tool runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Runs inline on the controller's context
    Synchronous,
    /// Network-bound; runs on a spawned task and reports back
    Asynchronous,
    /// Fulfilled by the provider; observed only
    ServerExecuted,
}

/// Role a tool plays in the dispatch heuristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    /// Mutates the editor by running code
    CodeExecution,
    /// Read-only query whose matches confirm a change
    Verification,
    /// Produces an image for the next request
    Capture,
    /// Produces external assets
    Generation,
    Inspection,
}

/// Tool trait - interface for all agent tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name used in function calls
    fn name(&self) -> &str;

    /// Description of what the tool does
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters(&self) -> Value;

    fn capability(&self) -> Capability {
        Capability::Synchronous
    }

    fn class(&self) -> ToolClass {
        ToolClass::Inspection
    }

    /// Provider-native declaration for hosted tools
    fn hosted_definition(&self) -> Option<Value> {
        None
    }

    /// Execute the tool with given parameters
    async fn execute(&self, params: Value) -> Result<String>;

    /// Convert to tool definition for LLM
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
            hosted: self.hosted_definition(),
        }
    }
}

/// Fixed-output tool for testing
#[cfg(test)]
pub struct StaticTool {
    pub name: String,
    pub result: String,
    pub capability: Capability,
    pub class: ToolClass,
}

#[cfg(test)]
impl StaticTool {
    pub fn new(name: &str, result: &str) -> Self {
        Self {
            name: name.to_string(),
            result: result.to_string(),
            capability: Capability::Synchronous,
            class: ToolClass::Inspection,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    pub fn with_class(mut self, class: ToolClass) -> Self {
        self.class = class;
        self
    }
}

#[cfg(test)]
#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str { &self.name }
    fn description(&self) -> &str { "Static tool for testing" }
    fn parameters(&self) -> Value { serde_json::json!({"type": "object"}) }
    fn capability(&self) -> Capability { self.capability }
    fn class(&self) -> ToolClass { self.class }

    fn hosted_definition(&self) -> Option<Value> {
        (self.capability == Capability::ServerExecuted)
            .then(|| serde_json::json!({"type": self.name}))
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        Ok(self.result.clone())
    }
}
