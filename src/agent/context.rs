//! Agent instructions builder.
//!
//! Workspace notes are read once at construction and cached.

use std::path::{Path, PathBuf};

use crate::config::Settings;

/// Workspace files appended to the instructions when present
const WORKSPACE_FILES: [&str; 2] = ["AGENTS.md", "EDITOR.md"];

/// Everything that goes into the agent's instructions.
pub struct Context {
    workspace: PathBuf,
    tool_names: Vec<String>,
    /// Cached workspace file content (loaded at construction).
    cached_workspace_notes: String,
}

impl Context {
    pub fn new(settings: &Settings, tool_names: Vec<String>) -> Self {
        Self::with_workspace(&settings.workspace, tool_names)
    }

    pub fn with_workspace(workspace: &Path, tool_names: Vec<String>) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            tool_names,
            cached_workspace_notes: load_workspace_notes(workspace),
        }
    }

    /// Build the instruction text sent with stateful requests.
    pub fn build_instructions(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        parts.push(self.identity());
        parts.push(self.tool_guidance());

        if !self.cached_workspace_notes.is_empty() {
            parts.push(self.cached_workspace_notes.clone());
        }

        parts.join("\n\n---\n\n")
    }

    fn identity(&self) -> String {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");

        format!(
            r#"# EditorGPT

You are EditorGPT, a copilot for a 3D editor. You act: change the open project by calling tools
instead of describing steps the user would have to perform by hand.

## Current Time
{}

## Workspace
Scripts and generated assets are staged under `{}`."#,
            now,
            self.workspace.display()
        )
    }

    fn tool_guidance(&self) -> String {
        let mut text = String::from("## Tools\n");
        if self.tool_names.is_empty() {
            text.push_str("No tools are enabled; answer in text only.");
            return text;
        }

        text.push_str("Available: ");
        let names: Vec<String> = self.tool_names.iter().map(|n| format!("`{}`", n)).collect();
        text.push_str(&names.join(", "));
        text.push_str(
            r#"

- Treat every request as a task to carry out with tools, in small focused steps.
- `python_execute` runs inside a wrapper with a shared `result` dict. Set `result["status"]`
  (`ok` or `error`), `result["message"]` and `result["details"]`; uncaught exceptions are
  reported as `error` with a traceback.
- After `python_execute`, verify with `scene_query` or `viewport_screenshot` before running more code.
  Do not run the same or nearly the same script twice in a row.
- When a quantity is requested, count what already exists from tool results and stop once it is met.
- Prefer adjusting existing actors over spawning duplicates.
- When verification confirms the request is done, reply with a short confirmation and stop calling tools."#,
        );
        text
    }
}

fn load_workspace_notes(workspace: &Path) -> String {
    let mut parts = Vec::with_capacity(WORKSPACE_FILES.len());

    for filename in WORKSPACE_FILES {
        let path = workspace.join(filename);
        if let Ok(content) = std::fs::read_to_string(&path) {
            if !content.trim().is_empty() {
                parts.push(format!("## {}\n\n{}", filename, content.trim()));
            }
        }
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_instructions_list_tools() {
        let dir = tempdir().unwrap();
        let ctx = Context::with_workspace(dir.path(), vec!["python_execute".into(), "scene_query".into()]);
        let instructions = ctx.build_instructions();

        assert!(instructions.contains("EditorGPT"));
        assert!(instructions.contains("`python_execute`, `scene_query`"));
        assert!(!instructions.contains("AGENTS.md"));
    }

    #[test]
    fn test_no_tools() {
        let dir = tempdir().unwrap();
        let ctx = Context::with_workspace(dir.path(), vec![]);
        assert!(ctx.build_instructions().contains("No tools are enabled"));
    }

    #[test]
    fn test_workspace_notes_cached_at_construction() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Levels live under /Game/Maps.").unwrap();

        let ctx = Context::with_workspace(dir.path(), vec![]);
        assert!(ctx.build_instructions().contains("## AGENTS.md\n\nLevels live under /Game/Maps."));

        std::fs::write(dir.path().join("EDITOR.md"), "Use metric units.").unwrap();
        assert!(!ctx.build_instructions().contains("metric"));
    }
}
