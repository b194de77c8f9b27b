use colored::*;
use terminal_size::{Width, Height, terminal_size};

use crate::agent::{AgentEvent, Role, TurnOutcome};

/// Longest tool argument or result shown inline
const PREVIEW_CHARS: usize = 200;

pub fn print_header(model: &str, mode: &str) {
    let (width, _) = terminal_size().unwrap_or((Width(80), Height(24)));
    let width = width.0 as usize;

    let line = "─".repeat(width);
    println!("{}", line.black().bold());

    let name = "EditorGPT".yellow().bold();
    let version = format!("v{}", env!("CARGO_PKG_VERSION")).black().bold();
    println!("  {} {}", name, version);

    let info = format!("  {}  •  {}", model, mode).cyan();
    println!("{}", info);

    if let Ok(path) = std::env::current_dir() {
        let path_str = path.to_string_lossy().black().bold();
        println!("  {}", path_str);
    }

    println!("{}", line.black().bold());
}

pub fn print_step(msg: &str) {
    println!("  {} {}", "•".green(), msg);
}

pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green().bold(), msg.green());
}

pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠️ ".yellow().bold(), msg.yellow());
}

pub fn print_error(msg: &str) {
    println!("  {} {}", "❌".red().bold(), msg.red());
}

pub fn print_thinking(msg: &str) {
    println!("  {} {}...", "∴".magenta(), msg);
}

/// Print one agent notification.
pub fn render_event(event: &AgentEvent) {
    match event {
        AgentEvent::Message { role: Role::Assistant, content, tool_call_ids } => {
            if tool_call_ids.is_empty() {
                println!("\n{}\n", content);
            } else {
                print_thinking(content.trim_end_matches("..."));
            }
        }
        AgentEvent::Message { content, .. } => print_step(content),
        AgentEvent::Reasoning(summary) => print_thinking(&preview(summary)),
        AgentEvent::ToolCall { name, arguments } => {
            print_step(&format!("{} {}", name.cyan(), preview(arguments).black().bold()));
        }
        AgentEvent::ToolResult { result, .. } => print_step(&preview(result)),
        AgentEvent::TurnFinished(outcome) => match outcome {
            TurnOutcome::Completed => {}
            TurnOutcome::NoContent => print_warning("The model returned no content"),
            TurnOutcome::ServerHandled => print_success("Handled by the provider"),
            TurnOutcome::LoopLimit { max } => print_warning(&format!(
                "Stopped for safety after {} tool iterations. Send a message to continue.",
                max
            )),
            TurnOutcome::Failed(reason) => print_error(reason),
            TurnOutcome::Cancelled => print_warning("Cancelled"),
        },
    }
}

/// First line of `text`, capped for display
fn preview(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    let mut shown: String = first_line.chars().take(PREVIEW_CHARS).collect();
    if shown.len() < text.len() {
        shown.push('…');
    }
    shown
}
