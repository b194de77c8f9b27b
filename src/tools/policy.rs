//! Dispatch policy: call signatures, repeat handling and completion heuristics

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{PolicyHint, ToolClass};

/// Signature of a call: tool name plus a hash of its normalized arguments.
///
/// Arguments that parse as JSON are re-serialized so key order and whitespace
/// do not matter.
pub fn call_signature(name: &str, arguments: &str) -> String {
    let normalized = match serde_json::from_str::<Value>(arguments) {
        Ok(value) => value.to_string(),
        Err(_) => arguments.trim().to_string(),
    };
    format!("{}:{:x}", name, Sha256::digest(normalized.as_bytes()))
}

/// What to do with a call whose signature was already recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatPolicy {
    /// Record only
    #[default]
    Allow,
    /// Execute, and tell the model it repeated itself
    Warn,
    /// Answer with an error result instead of executing
    Block,
}

/// Heuristic state derived from recent tool results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchHeuristics {
    /// Last mutating tool ran after the last verification
    pub last_tool_was_side_effecting: bool,
    /// Last verification returned at least one match
    pub last_verification_found_results: bool,
    code_execution_succeeded: bool,
    generation_succeeded: bool,
    generation_imported: bool,
}

impl DispatchHeuristics {
    /// Update the flags from one tool result.
    pub fn observe(&mut self, class: ToolClass, raw_output: &str) {
        match class {
            ToolClass::CodeExecution => {
                let ok = status_of(raw_output).as_deref() == Some("ok");
                self.code_execution_succeeded = ok;
                self.last_tool_was_side_effecting = true;
                if ok && mentions_import(raw_output) {
                    self.generation_imported = true;
                }
            }
            ToolClass::Generation => {
                self.generation_succeeded = generation_produced_files(raw_output);
                self.last_tool_was_side_effecting = true;
            }
            ToolClass::Verification => {
                self.last_verification_found_results = is_non_empty_array(raw_output);
                self.last_tool_was_side_effecting = false;
            }
            ToolClass::Capture | ToolClass::Inspection => {}
        }
    }

    /// Hint for a result, judged against the state before that result is observed.
    pub fn advise(&self, class: ToolClass, raw_output: &str) -> Option<PolicyHint> {
        match class {
            ToolClass::CodeExecution if status_of(raw_output).as_deref() == Some("ok") => {
                Some(PolicyHint::VerifyAfterExecution)
            }
            ToolClass::Verification if is_non_empty_array(raw_output) => {
                if self.last_verification_found_results && !self.last_tool_was_side_effecting {
                    Some(PolicyHint::RedundantVerification)
                } else if self.detect_task_completion() {
                    Some(PolicyHint::TaskLikelyComplete)
                } else {
                    Some(PolicyHint::EvaluateCompletion)
                }
            }
            _ => None,
        }
    }

    /// A mutation succeeded and is waiting for (or got) a positive verification.
    ///
    /// Either scripted code ran with status `ok`, or generated files were
    /// downloaded and then imported by a script.
    pub fn detect_task_completion(&self) -> bool {
        self.code_execution_succeeded || (self.generation_succeeded && self.generation_imported)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn status_of(raw_output: &str) -> Option<String> {
    serde_json::from_str::<Value>(raw_output)
        .ok()?
        .get("status")?
        .as_str()
        .map(str::to_lowercase)
}

fn is_non_empty_array(raw_output: &str) -> bool {
    matches!(
        serde_json::from_str::<Value>(raw_output),
        Ok(Value::Array(items)) if !items.is_empty()
    )
}

fn generation_produced_files(raw_output: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(raw_output) else {
        return false;
    };
    let succeeded = value.get("status").and_then(Value::as_str) == Some("success");
    let has_files = value
        .pointer("/details/files")
        .and_then(Value::as_array)
        .map(|files| !files.is_empty())
        .unwrap_or(false);
    succeeded && has_files
}

fn mentions_import(raw_output: &str) -> bool {
    let message = serde_json::from_str::<Value>(raw_output)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_lowercase))
        .unwrap_or_default();
    message.contains("imported")
        && ["texture", "mesh", "audio"].iter().any(|kind| message.contains(kind))
}
