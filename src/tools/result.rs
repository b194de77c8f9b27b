//! Tool results and the control hints attached to them

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ToolClass;

/// Base64 prefix of every PNG file
const PNG_BASE64_PREFIX: &str = "iVBORw0KGgo";

/// Synthetic instruction appended to a tool result to steer the model's next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyHint {
    /// Code execution succeeded: verify instead of executing again
    VerifyAfterExecution,
    /// Verification found matching state: decide whether the task is done
    EvaluateCompletion,
    /// Mutation followed by successful verification
    TaskLikelyComplete,
    /// Verification repeated with nothing changed in between
    RedundantVerification,
    /// Same call with identical arguments was already executed this task
    RepeatedCall,
}

impl PolicyHint {
    pub fn instruction(&self) -> &'static str {
        match self {
            PolicyHint::VerifyAfterExecution => {
                "[System: After this python_execute, you MUST reason about whether the task is complete. \
                 If you are not sure, use scene_query or viewport_screenshot to verify the result. \
                 Do NOT execute another python_execute unless verification clearly shows the task failed or is incomplete.]"
            }
            PolicyHint::EvaluateCompletion => {
                "[System: Based on these scene_query results and previous tool outputs, evaluate whether the user's \
                 request has been completed. If the task is complete, provide a brief confirmation message and STOP. \
                 If not complete, continue with next steps.]"
            }
            PolicyHint::TaskLikelyComplete => {
                "[System: The change was executed successfully and verification found the expected objects. \
                 The task is most likely complete. Reply with a brief confirmation and STOP calling tools \
                 unless something is clearly missing.]"
            }
            PolicyHint::RedundantVerification => {
                "[System: The scene was already verified with matching results and nothing has changed since. \
                 Do not query again for the same goal; decide whether the task is complete.]"
            }
            PolicyHint::RepeatedCall => {
                "[System: This exact tool call was already executed earlier in this task with identical arguments. \
                 Do not repeat it; rely on the earlier result or verify the scene instead.]"
            }
        }
    }
}

/// Outcome of one dispatched tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// Full output, delivered to observers
    pub raw_output: String,
    /// Output kept in history and sent to the model
    pub for_history: String,
    /// Decoded images to attach to the next request
    pub side_effect_images: Vec<Vec<u8>>,
    pub policy_hint: Option<PolicyHint>,
}

impl ToolResult {
    /// Build a result, enforcing the history size cap.
    ///
    /// Base64 PNG payloads are replaced by a short marker; capture-class tools
    /// also hand the decoded image bytes back for the next request.
    pub fn new(raw_output: String, class: ToolClass, max_size: usize) -> Self {
        let mut side_effect_images = Vec::new();

        let for_history = if raw_output.starts_with(PNG_BASE64_PREFIX) {
            if class == ToolClass::Capture {
                match STANDARD.decode(raw_output.trim()) {
                    Ok(bytes) => side_effect_images.push(bytes),
                    Err(e) => warn!("Screenshot payload is not valid base64: {}", e),
                }
            }
            screenshot_marker(raw_output.len())
        } else {
            truncate_for_history(&raw_output, max_size)
        };

        Self {
            raw_output,
            for_history,
            side_effect_images,
            policy_hint: None,
        }
    }
}

fn screenshot_marker(len: usize) -> String {
    format!(
        "Screenshot captured successfully. [Base64 image data omitted from history to prevent context overflow - \
         the image was captured and can be viewed in the UI. Length: {} characters]",
        len
    )
}

/// Cap `text` at `max_chars` characters, appending a marker with the original length.
pub fn truncate_for_history(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    debug!("Truncating tool result from {} to {} characters", total, max_chars);
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(&format!(
        "\n\n[Result truncated - original length: {} characters. Full result available in tool output.]",
        total
    ));
    truncated
}
