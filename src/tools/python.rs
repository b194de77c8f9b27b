//! Python tool - run editor scripts inside a result-reporting wrapper

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;
use crate::Result;
use crate::error::Error;
use super::{Tool, ToolClass};

const NO_RESULT_MESSAGE: &str = "Python code was sent to the editor for execution, but no structured result JSON \
was produced. The script may have succeeded or failed; check the editor's Python log for details, and write to \
the shared `result` dict in future runs.";

/// Captured output of one script run
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a script file in the editor's scripting environment
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    async fn run(&self, script: &Path, timeout: Duration) -> Result<ScriptOutput>;
}

/// Runs scripts with an external interpreter process
pub struct ProcessRuntime {
    program: String,
}

impl ProcessRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

#[async_trait]
impl ScriptRuntime for ProcessRuntime {
    async fn run(&self, script: &Path, timeout: Duration) -> Result<ScriptOutput> {
        let mut command = Command::new(&self.program);
        command.arg(script).kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| Error::Tool(format!(
                "Script timed out after {} seconds",
                timeout.as_secs()
            )))?
            .map_err(|e| Error::Tool(format!("Failed to start {}: {}", self.program, e)))?;

        Ok(ScriptOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Wrap user code so it reports `{status, message, details}` to `result_path`.
pub fn build_wrapper(code: &str, result_path: &Path) -> String {
    let mut wrapped = String::new();
    wrapped.push_str("import json, traceback, os\n");
    wrapped.push_str("try:\n    import unreal\nexcept ImportError:\n    unreal = None\n\n");
    wrapped.push_str("result = {\n");
    wrapped.push_str("    \"status\": \"ok\",\n");
    wrapped.push_str("    \"message\": \"Python code executed. No custom result message was set.\",\n");
    wrapped.push_str("    \"details\": {}\n");
    wrapped.push_str("}\n\n");

    wrapped.push_str("try:\n");
    let mut body_lines = 0;
    for line in code.lines() {
        if line.trim().is_empty() {
            wrapped.push_str("    \n");
        } else {
            wrapped.push_str("    ");
            wrapped.push_str(line);
            wrapped.push('\n');
            body_lines += 1;
        }
    }
    if body_lines == 0 {
        wrapped.push_str("    pass\n");
    }
    wrapped.push_str("except Exception as e:\n");
    wrapped.push_str("    result[\"status\"] = \"error\"\n");
    wrapped.push_str("    result[\"message\"] = str(e)\n");
    wrapped.push_str("    result[\"details\"][\"traceback\"] = traceback.format_exc()\n\n");

    // A JSON string literal is also a valid Python string literal
    let literal = Value::String(result_path.to_string_lossy().to_string()).to_string();
    wrapped.push_str(&format!("result_path = {}\n", literal));
    wrapped.push_str("with open(result_path, \"w\", encoding=\"utf-8\") as f:\n");
    wrapped.push_str("    f.write(json.dumps(result))\n");
    wrapped
}

/// Execute Python in the editor
pub struct PythonExecuteTool {
    runtime: Arc<dyn ScriptRuntime>,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl PythonExecuteTool {
    pub fn new(runtime: Arc<dyn ScriptRuntime>, scratch_dir: PathBuf, timeout: Duration) -> Self {
        Self { runtime, scratch_dir, timeout }
    }
}

#[async_trait]
impl Tool for PythonExecuteTool {
    fn name(&self) -> &str { "python_execute" }

    fn description(&self) -> &str {
        "Run Python editor scripting code. The code runs inside a wrapper exposing a `result` dict \
         (status, message, details) that is returned as JSON; exceptions set status to 'error' with a traceback."
    }

    fn class(&self) -> ToolClass { ToolClass::CodeExecution }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python source to execute; `import unreal` is available"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let code = params.get("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Tool("Missing 'code' parameter".to_string()))?;

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let id = Uuid::new_v4().simple().to_string();
        let script_path = self.scratch_dir.join(format!("editorgpt_{}.py", id));
        let result_path = self.scratch_dir.join(format!("editorgpt_{}.json", id));

        tokio::fs::write(&script_path, build_wrapper(code, &result_path)).await?;
        debug!("Running script {:?}", script_path);

        let run = self.runtime.run(&script_path, self.timeout).await;
        let result = tokio::fs::read_to_string(&result_path).await.ok();

        for path in [&script_path, &result_path] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {:?}: {}", path, e);
                }
            }
        }

        let output = run?;
        match result {
            Some(json) => Ok(json),
            None if !output.stderr.trim().is_empty() => {
                Ok(format!("{}\n\n[stderr]\n{}", NO_RESULT_MESSAGE, output.stderr.trim()))
            }
            None => Ok(NO_RESULT_MESSAGE.to_string()),
        }
    }
}
