//! Scene access for the editor tools.
//!
//! The agent never talks to the editor directly; it goes through a
//! [`SceneBackend`]. The CLI host uses [`SnapshotScene`], which reads a JSON
//! snapshot exported by the editor each time it is queried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Error;
use crate::Result;

/// World-space position
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One actor in the level
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub name: String,
    #[serde(default)]
    pub label: String,
    pub class: String,
    #[serde(default)]
    pub location: Location,
    /// Component class names
    #[serde(default)]
    pub components: Vec<String>,
}

/// Case-insensitive substring filters for actor queries
#[derive(Debug, Clone, PartialEq)]
pub struct ActorFilter {
    pub class_contains: Option<String>,
    pub label_contains: Option<String>,
    pub name_contains: Option<String>,
    pub component_class_contains: Option<String>,
    pub max_results: usize,
}

impl Default for ActorFilter {
    fn default() -> Self {
        Self {
            class_contains: None,
            label_contains: None,
            name_contains: None,
            component_class_contains: None,
            max_results: 20,
        }
    }
}

impl ActorFilter {
    /// Build a filter from tool arguments; unknown keys are ignored.
    pub fn from_params(params: &Value) -> Self {
        let text = |key: &str| {
            params.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
        };

        let max_results = params.get("max_results")
            .and_then(Value::as_i64)
            .map(|n| n.max(1) as usize)
            .unwrap_or(20);

        Self {
            class_contains: text("class_contains"),
            label_contains: text("label_contains"),
            name_contains: text("name_contains"),
            component_class_contains: text("component_class_contains"),
            max_results,
        }
    }

    pub fn matches(&self, actor: &ActorRecord) -> bool {
        let contains = |haystack: &str, needle: &Option<String>| match needle {
            Some(needle) => haystack.to_lowercase().contains(needle.as_str()),
            None => true,
        };

        contains(&actor.class, &self.class_contains)
            && contains(&actor.label, &self.label_contains)
            && contains(&actor.name, &self.name_contains)
            && match &self.component_class_contains {
                Some(_) => actor
                    .components
                    .iter()
                    .any(|c| contains(c, &self.component_class_contains)),
                None => true,
            }
    }

    /// Matching actors, in scene order, capped at `max_results`.
    pub fn apply<'a>(&self, actors: &'a [ActorRecord]) -> Vec<&'a ActorRecord> {
        actors.iter()
            .filter(|actor| self.matches(actor))
            .take(self.max_results)
            .collect()
    }
}

/// Read access to the live editor scene
pub trait SceneBackend: Send + Sync {
    /// All actors in the current level
    fn actors(&self) -> Result<Vec<ActorRecord>>;

    /// PNG bytes of the active viewport
    fn capture_viewport(&self) -> Result<Vec<u8>>;

    /// Reflected members of a class, if the class exists
    fn describe_class(&self, class_name: &str) -> Result<Option<Value>>;
}

#[derive(Debug, Default, Deserialize)]
struct Snapshot {
    #[serde(default)]
    actors: Vec<ActorRecord>,
    #[serde(default)]
    classes: HashMap<String, Value>,
    /// Path of the last viewport capture, relative to the snapshot file
    #[serde(default)]
    viewport_image: Option<PathBuf>,
}

/// Scene backend reading an exported JSON snapshot
pub struct SnapshotScene {
    path: PathBuf,
}

impl SnapshotScene {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<Snapshot> {
        if !self.path.exists() {
            return Err(Error::Tool(format!(
                "Scene snapshot not found at {:?}",
                self.path
            )));
        }

        let content = std::fs::read_to_string(&self.path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        debug!("Loaded scene snapshot with {} actors", snapshot.actors.len());
        Ok(snapshot)
    }

    fn resolve(&self, relative: &Path) -> PathBuf {
        match self.path.parent() {
            Some(dir) if relative.is_relative() => dir.join(relative),
            _ => relative.to_path_buf(),
        }
    }
}

impl SceneBackend for SnapshotScene {
    fn actors(&self) -> Result<Vec<ActorRecord>> {
        Ok(self.load()?.actors)
    }

    fn capture_viewport(&self) -> Result<Vec<u8>> {
        let image = self.load()?
            .viewport_image
            .ok_or_else(|| Error::Tool("Scene snapshot has no viewport capture".to_string()))?;
        Ok(std::fs::read(self.resolve(&image))?)
    }

    fn describe_class(&self, class_name: &str) -> Result<Option<Value>> {
        let snapshot = self.load()?;
        Ok(snapshot.classes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(class_name))
            .map(|(_, description)| description.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn actor(name: &str, label: &str, class: &str, components: &[&str]) -> ActorRecord {
        ActorRecord {
            name: name.to_string(),
            label: label.to_string(),
            class: class.to_string(),
            location: Location::default(),
            components: components.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_filter_case_insensitive() {
        let actors = vec![
            actor("PointLight_0", "Key Light", "PointLight", &["PointLightComponent"]),
            actor("Cube_1", "Cube", "StaticMeshActor", &["StaticMeshComponent"]),
        ];

        let filter = ActorFilter::from_params(&json!({"class_contains": "pointlight"}));
        let found = filter.apply(&actors);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "PointLight_0");

        let filter = ActorFilter::from_params(&json!({"component_class_contains": "MESH"}));
        assert_eq!(filter.apply(&actors)[0].name, "Cube_1");
    }

    #[test]
    fn test_filter_max_results_minimum() {
        let actors: Vec<ActorRecord> = (0..5)
            .map(|i| actor(&format!("Cube_{}", i), "Cube", "StaticMeshActor", &[]))
            .collect();

        let filter = ActorFilter::from_params(&json!({"max_results": 0}));
        assert_eq!(filter.max_results, 1);
        assert_eq!(filter.apply(&actors).len(), 1);

        let filter = ActorFilter::from_params(&json!({}));
        assert_eq!(filter.max_results, 20);
        assert_eq!(filter.apply(&actors).len(), 5);
    }

    #[test]
    fn test_snapshot_scene() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scene.json");
        std::fs::write(tmp.path().join("shot.png"), [1u8, 2, 3]).unwrap();
        std::fs::write(&path, json!({
            "actors": [{"name": "Floor", "class": "StaticMeshActor"}],
            "classes": {"StaticMeshActor": {"properties": ["StaticMeshComponent"]}},
            "viewport_image": "shot.png"
        }).to_string()).unwrap();

        let scene = SnapshotScene::new(&path);
        assert_eq!(scene.actors().unwrap().len(), 1);
        assert_eq!(scene.capture_viewport().unwrap(), vec![1, 2, 3]);
        assert!(scene.describe_class("staticmeshactor").unwrap().is_some());
        assert!(scene.describe_class("Missing").unwrap().is_none());
    }

    #[test]
    fn test_missing_snapshot_is_tool_error() {
        let scene = SnapshotScene::new("/nonexistent/scene.json");
        assert!(matches!(scene.actors(), Err(Error::Tool(_))));
    }
}
