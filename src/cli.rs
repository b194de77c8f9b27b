//! CLI session - interactive and single-message command line interface.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::agent::{
    AgentClient, AgentEvent, AgentHandle, Context, ControllerConfig, LoopController,
    ReqwestTransport, TurnOutcome,
};
use crate::config::Settings;
use crate::error::Error;
use crate::scene::SnapshotScene;
use crate::tools::{ProcessRuntime, ToolRegistry};
use crate::ui;
use crate::Result;

/// Build the tool registry and controller from settings and start the client task.
pub fn start_agent(settings: &Settings) -> Result<(AgentHandle, UnboundedReceiver<AgentEvent>)> {
    let mode = settings.provider_mode();
    let snapshot = settings
        .scene_snapshot
        .clone()
        .unwrap_or_else(|| settings.workspace.join("scene.json"));

    let registry = ToolRegistry::from_settings(
        settings,
        mode,
        Arc::new(SnapshotScene::new(snapshot)),
        Arc::new(ProcessRuntime::new(settings.python_program.clone())),
    )?;
    let tool_names: Vec<String> = registry.tool_names().iter().map(|n| n.to_string()).collect();
    info!("Starting agent ({} mode) with tools: {}", mode.as_str(), tool_names.join(", "));

    let context = Context::new(settings, tool_names);
    let config = ControllerConfig::from_settings(settings, context.build_instructions());
    let controller = LoopController::new(config, Arc::new(registry));
    let transport = ReqwestTransport::new(Duration::from_secs(settings.request_timeout_secs))?;

    Ok(AgentClient::spawn(controller, Arc::new(transport)))
}

/// Terminal front end over a running agent client
pub struct CliSession {
    handle: AgentHandle,
    events: UnboundedReceiver<AgentEvent>,
}

impl CliSession {
    pub fn new(handle: AgentHandle, events: UnboundedReceiver<AgentEvent>) -> Self {
        Self { handle, events }
    }

    /// Handle for cancelling from outside the session (Ctrl+C).
    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Send one message and render events until its turn finishes.
    pub async fn run_once(&mut self, message: &str) -> Result<TurnOutcome> {
        self.handle.send_message(message, Vec::new()).await?;

        while let Some(event) = self.events.recv().await {
            ui::render_event(&event);
            if let AgentEvent::TurnFinished(outcome) = event {
                return Ok(outcome);
            }
        }

        Err(Error::InvalidState("Agent client has stopped".to_string()))
    }

    /// Run interactive REPL loop.
    pub async fn run_interactive(&mut self) -> Result<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();

        loop {
            print!("\n> ");
            stdout.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                // EOF
                break;
            }

            let input = line.trim();
            if input.is_empty() {
                continue;
            }

            if matches!(input.to_lowercase().as_str(), "exit" | "quit" | "q") {
                println!("Goodbye! 👋");
                break;
            }

            if input == "/clear" {
                self.handle.clear();
                ui::print_success("Conversation cleared");
                continue;
            }

            if let Err(e) = self.run_once(input).await {
                ui::print_error(&e.to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::agent::transport::FakeTransport;
    use crate::agent::ProviderMode;
    use crate::tools::RepeatPolicy;

    fn session(transport: FakeTransport) -> CliSession {
        let config = ControllerConfig {
            url: "https://api.example.com/v1/chat/completions".to_string(),
            api_key: Some("sk-test".to_string()),
            mode: ProviderMode::Stateless,
            model: "gpt-4o".to_string(),
            instructions: String::new(),
            max_iterations: 5,
            max_tool_result_size: 10000,
            repeat_policy: RepeatPolicy::Allow,
            policy_hints: true,
        };
        let controller = LoopController::new(config, Arc::new(ToolRegistry::new()));
        let (handle, events) = AgentClient::spawn(controller, Arc::new(transport));
        CliSession::new(handle, events)
    }

    #[tokio::test]
    async fn test_run_once() {
        let transport = FakeTransport::with_bodies(vec![
            json!({"choices": [{"message": {"role": "assistant", "content": "Hello!"}}]}),
        ]);
        let mut session = session(transport);

        assert_eq!(session.run_once("hi").await.unwrap(), TurnOutcome::Completed);
        assert_eq!(session.handle().history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_once_reports_failure() {
        let mut session = session(FakeTransport::new(vec![]));
        let outcome = session.run_once("hi").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_start_agent_from_settings() {
        let dir = tempdir().unwrap();
        let settings = Settings {
            api_key: "sk-test".to_string(),
            workspace: dir.path().to_path_buf(),
            ..Settings::default()
        };

        let (handle, _events) = start_agent(&settings).unwrap();
        assert!(handle.history().await.unwrap().is_empty());
    }
}
