//! Scene tools - query actors, capture the viewport, inspect classes

use std::sync::Arc;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use crate::Result;
use crate::error::Error;
use crate::scene::{ActorFilter, SceneBackend};
use super::{Tool, ToolClass};

/// Find actors in the level
pub struct SceneQueryTool {
    scene: Arc<dyn SceneBackend>,
}

impl SceneQueryTool {
    pub fn new(scene: Arc<dyn SceneBackend>) -> Self {
        Self { scene }
    }
}

#[async_trait]
impl Tool for SceneQueryTool {
    fn name(&self) -> &str { "scene_query" }

    fn description(&self) -> &str {
        "Search actors in the current level by class, label, name or component class. \
         Returns a JSON array of matches with their locations; use it to verify changes."
    }

    fn class(&self) -> ToolClass { ToolClass::Verification }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "class_contains": {
                    "type": "string",
                    "description": "Case-insensitive substring of the actor class"
                },
                "label_contains": {
                    "type": "string",
                    "description": "Case-insensitive substring of the outliner label"
                },
                "name_contains": {
                    "type": "string",
                    "description": "Case-insensitive substring of the object name"
                },
                "component_class_contains": {
                    "type": "string",
                    "description": "Match actors owning a component whose class contains this text"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum matches to return (default 20)"
                }
            }
        })
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let filter = ActorFilter::from_params(&params);
        let actors = self.scene.actors()?;

        let matches: Vec<Value> = filter.apply(&actors)
            .into_iter()
            .map(|actor| json!({
                "name": actor.name,
                "label": actor.label,
                "class": actor.class,
                "location": {
                    "x": actor.location.x,
                    "y": actor.location.y,
                    "z": actor.location.z
                }
            }))
            .collect();

        Ok(Value::Array(matches).to_string())
    }
}

/// Capture the active viewport as a base64 PNG
pub struct ViewportScreenshotTool {
    scene: Arc<dyn SceneBackend>,
}

impl ViewportScreenshotTool {
    pub fn new(scene: Arc<dyn SceneBackend>) -> Self {
        Self { scene }
    }
}

#[async_trait]
impl Tool for ViewportScreenshotTool {
    fn name(&self) -> &str { "viewport_screenshot" }

    fn description(&self) -> &str {
        "Capture the active editor viewport. The image is attached to your next turn."
    }

    fn class(&self) -> ToolClass { ToolClass::Capture }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        let png = self.scene.capture_viewport()?;
        Ok(STANDARD.encode(png))
    }
}

/// Inspect a class through the editor's reflection data
pub struct ReflectionQueryTool {
    scene: Arc<dyn SceneBackend>,
}

impl ReflectionQueryTool {
    pub fn new(scene: Arc<dyn SceneBackend>) -> Self {
        Self { scene }
    }
}

#[async_trait]
impl Tool for ReflectionQueryTool {
    fn name(&self) -> &str { "reflection_query" }

    fn description(&self) -> &str {
        "List the reflected properties and functions of a class (engine, plugin or project type) \
         before writing Python against it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "class_name": {
                    "type": "string",
                    "description": "Class to inspect, e.g. StaticMeshActor"
                }
            },
            "required": ["class_name"]
        })
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let class_name = params.get("class_name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Tool("Missing 'class_name' parameter".to_string()))?;

        match self.scene.describe_class(class_name)? {
            Some(description) => Ok(json!({
                "status": "ok",
                "class_name": class_name,
                "details": description
            }).to_string()),
            None => Ok(json!({
                "status": "error",
                "message": format!("Class '{}' was not found", class_name)
            }).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{ActorRecord, Location};

    struct FixedScene;

    impl SceneBackend for FixedScene {
        fn actors(&self) -> Result<Vec<ActorRecord>> {
            Ok(vec![
                ActorRecord {
                    name: "Cube_1".to_string(),
                    label: "Cube".to_string(),
                    class: "StaticMeshActor".to_string(),
                    location: Location { x: 1.0, y: 2.0, z: 3.0 },
                    components: vec!["StaticMeshComponent".to_string()],
                },
                ActorRecord {
                    name: "Sun".to_string(),
                    label: "Sun".to_string(),
                    class: "DirectionalLight".to_string(),
                    ..Default::default()
                },
            ])
        }

        fn capture_viewport(&self) -> Result<Vec<u8>> {
            Ok(vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a])
        }

        fn describe_class(&self, class_name: &str) -> Result<Option<Value>> {
            Ok((class_name == "StaticMeshActor").then(|| json!({"functions": ["set_actor_location"]})))
        }
    }

    #[tokio::test]
    async fn test_scene_query_output_shape() {
        let tool = SceneQueryTool::new(Arc::new(FixedScene));
        let output = tool.execute(json!({"label_contains": "cube"})).await.unwrap();

        let parsed: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
        assert_eq!(parsed[0]["name"], "Cube_1");
        assert_eq!(parsed[0]["location"]["z"], 3.0);
    }

    #[tokio::test]
    async fn test_scene_query_no_matches() {
        let tool = SceneQueryTool::new(Arc::new(FixedScene));
        let output = tool.execute(json!({"class_contains": "Fog"})).await.unwrap();
        assert_eq!(output, "[]");
    }

    #[tokio::test]
    async fn test_screenshot_is_png_base64() {
        let tool = ViewportScreenshotTool::new(Arc::new(FixedScene));
        let output = tool.execute(json!({})).await.unwrap();
        assert!(output.starts_with("iVBORw0KGgo"));
    }

    #[tokio::test]
    async fn test_reflection_query() {
        let tool = ReflectionQueryTool::new(Arc::new(FixedScene));

        assert!(tool.execute(json!({})).await.is_err());

        let found: Value = serde_json::from_str(
            &tool.execute(json!({"class_name": "StaticMeshActor"})).await.unwrap(),
        ).unwrap();
        assert_eq!(found["status"], "ok");

        let missing: Value = serde_json::from_str(
            &tool.execute(json!({"class_name": "Nope"})).await.unwrap(),
        ).unwrap();
        assert_eq!(missing["status"], "error");
    }
}
