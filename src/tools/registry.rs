//! Tool registry - maps tool names to handlers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::Result;
use crate::agent::ProviderMode;
use crate::config::Settings;
use crate::error::Error;
use crate::scene::SceneBackend;
use super::{Capability, Tool, ToolClass};
use super::python::{PythonExecuteTool, ScriptRuntime};
use super::scene::{ReflectionQueryTool, SceneQueryTool, ViewportScreenshotTool};
use super::generate::ReplicateTool;
use super::hosted::{FileSearchTool, WebSearchTool};

/// Tool definition for LLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,

    /// Provider-native declaration; set only for hosted tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted: Option<Value>,
}

/// Registry of the tools offered to the model
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Create a registry with the tools enabled in settings
    pub fn from_settings(
        settings: &Settings,
        mode: ProviderMode,
        scene: Arc<dyn SceneBackend>,
        runtime: Arc<dyn ScriptRuntime>,
    ) -> Result<Self> {
        let mut registry = Self::new();

        if settings.enable_python_execution {
            registry.register(PythonExecuteTool::new(
                runtime,
                settings.workspace.join("scratch"),
                Duration::from_secs(settings.execution_timeout_secs),
            ));
        }

        if settings.enable_scene_query {
            registry.register(SceneQueryTool::new(scene.clone()));
        }
        if settings.enable_viewport_screenshot {
            registry.register(ViewportScreenshotTool::new(scene.clone()));
        }
        if settings.enable_reflection_query {
            registry.register(ReflectionQueryTool::new(scene));
        }

        if settings.replicate.enabled {
            registry.register(ReplicateTool::new(
                settings.replicate.clone(),
                settings.staging_dir(),
            )?);
        }

        // Hosted tools only exist in the stateful dialect
        if mode == ProviderMode::Stateful {
            if settings.enable_web_search {
                registry.register(WebSearchTool);
            }
            if !settings.file_search_vector_store_ids.is_empty() {
                let stores = settings.file_search_vector_store_ids.clone();
                registry.register(FileSearchTool::new(stores));
            }
        }

        Ok(registry)
    }

    /// Register a tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Get tool definitions for LLM, ordered by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self.tools.values()
            .map(|t| t.to_definition())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Look up a tool handle
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Capability of a registered tool
    pub fn capability(&self, name: &str) -> Option<Capability> {
        self.tools.get(name).map(|t| t.capability())
    }

    /// Heuristic class of a tool; unknown names are plain inspections
    pub fn class(&self, name: &str) -> ToolClass {
        self.tools.get(name)
            .map(|t| t.class())
            .unwrap_or(ToolClass::Inspection)
    }

    /// Whether the provider fulfils calls to this tool itself
    pub fn is_server_executed(&self, name: &str) -> bool {
        self.capability(name) == Some(Capability::ServerExecuted)
    }

    /// List registered tool names, sorted
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse raw call arguments; empty input means no arguments.
pub fn parse_arguments(arguments: &str) -> Result<Value> {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(Default::default()));
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(Value::Null) => Ok(Value::Object(Default::default())),
        Ok(_) => Err(Error::Tool("Tool arguments must be a JSON object".to_string())),
        Err(e) => Err(Error::Tool(format!("Invalid JSON arguments: {}", e))),
    }
}
