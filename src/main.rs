//! EditorGPT CLI entry point

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use anyhow::Result;

use editorgpt::agent::AgentHandle;
use editorgpt::cli::{start_agent, CliSession};
use editorgpt::ui;

#[derive(Parser)]
#[command(name = "editorgpt")]
#[command(about = "EditorGPT - agentic copilot for a 3D editor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the workspace
    Init,

    /// Chat with the agent
    Agent {
        /// Message to send to the agent
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show EditorGPT status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            println!("Initializing EditorGPT...");
            let settings = editorgpt::config::init()?;
            let path = editorgpt::config::config_path();
            ui::print_success(&format!("Config written to {}", path.display()));
            println!("\nNext steps:");
            println!(
                "  1. Add your API key to the config or set {}",
                editorgpt::config::API_KEY_ENV
            );
            let snapshot = settings.workspace.join("scene.json");
            println!("  2. Export a scene snapshot to {}", snapshot.display());
            println!("  3. Chat: editorgpt agent -m \"Add a point light above the table\"");
        }

        Commands::Agent { message } => {
            let settings = editorgpt::config::load()?;
            let (handle, events) = start_agent(&settings)?;
            install_ctrlc(handle.clone());

            let mut session = CliSession::new(handle, events);
            if let Some(msg) = message {
                // Single message mode
                session.run_once(&msg).await?;
            } else {
                ui::print_header(&settings.model, settings.provider_mode().as_str());
                println!("Interactive mode (/clear resets, Ctrl+C cancels, 'exit' quits)");
                session.run_interactive().await?;
            }
        }

        Commands::Status => {
            let settings = editorgpt::config::load()?;
            let mode = settings.provider_mode();
            println!("EditorGPT Status\n");
            println!("Endpoint: {}", settings.effective_url());
            println!("Dialect: {}", mode.as_str());
            println!("Model: {}", settings.model);
            println!("Workspace: {:?}", settings.workspace);
            let key_status = if settings.resolved_api_key().is_some() { "✓" } else { "not set" };
            println!("API key: {}", key_status);
            println!("Max tool iterations: {}", settings.iteration_cap());
            println!("Tools: {}", enabled_tools(&settings, mode).join(", "));
        }
    }

    Ok(())
}

/// Ctrl+C cancels the in-flight turn; a second press within 3 seconds exits.
fn install_ctrlc(handle: AgentHandle) {
    let exit_flag = Arc::new(AtomicBool::new(false));
    let r = exit_flag.clone();

    ctrlc::set_handler(move || {
        if r.load(Ordering::SeqCst) {
            println!("\nBye!");
            std::process::exit(0);
        } else {
            handle.cancel();
            println!("\nCancelled. Press Ctrl+C again to exit");
            r.store(true, Ordering::SeqCst);

            // Reset flag after 3 seconds
            let r2 = r.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(3));
                r2.store(false, Ordering::SeqCst);
            });
        }
    }).ok();
}

fn enabled_tools(
    settings: &editorgpt::config::Settings,
    mode: editorgpt::agent::ProviderMode,
) -> Vec<String> {
    use editorgpt::scene::SnapshotScene;
    use editorgpt::tools::{ProcessRuntime, ToolRegistry};

    let registry = ToolRegistry::from_settings(
        settings,
        mode,
        Arc::new(SnapshotScene::new(settings.workspace.join("scene.json"))),
        Arc::new(ProcessRuntime::new(settings.python_program.clone())),
    );
    match registry {
        Ok(registry) => registry.tool_names().iter().map(|n| n.to_string()).collect(),
        Err(e) => vec![format!("unavailable ({})", e)],
    }
}
