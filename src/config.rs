//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::agent::ProviderMode;
use crate::tools::RepeatPolicy;
use crate::Result;
use crate::error::Error;

/// Environment variable consulted when no API key is stored in the config file
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Provider endpoint; its path selects the wire dialect
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Optional base URL (e.g. a proxy or a local server) the endpoint path is appended to
    #[serde(default)]
    pub base_url_override: String,

    /// Provider API key
    #[serde(default)]
    pub api_key: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Force a wire dialect instead of deriving it from the endpoint
    #[serde(default)]
    pub provider_mode: Option<ProviderMode>,

    #[serde(default = "default_true")]
    pub enable_python_execution: bool,

    #[serde(default = "default_true")]
    pub enable_viewport_screenshot: bool,

    #[serde(default = "default_true")]
    pub enable_scene_query: bool,

    #[serde(default = "default_true")]
    pub enable_reflection_query: bool,

    /// Provider-hosted web search (stateful dialect only)
    #[serde(default = "default_true")]
    pub enable_web_search: bool,

    /// Vector stores for provider-hosted file search; empty disables the tool
    #[serde(default)]
    pub file_search_vector_store_ids: Vec<String>,

    /// Maximum tool continuations since the last user message
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,

    /// Maximum characters of a single tool result kept in history
    #[serde(default = "default_max_tool_result_size")]
    pub max_tool_result_size: usize,

    /// Per-request transport timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Script execution timeout
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// What to do when a tool is called again with identical arguments
    #[serde(default)]
    pub repeat_policy: RepeatPolicy,

    /// Append verification/completion instructions to tool results sent to the model
    #[serde(default = "default_true")]
    pub policy_hints: bool,

    /// Workspace directory (instructions overrides, scratch files)
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Interpreter used to run `python_execute` scripts
    #[serde(default = "default_python_program")]
    pub python_program: String,

    /// JSON scene snapshot read by the scene tools
    #[serde(default)]
    pub scene_snapshot: Option<PathBuf>,

    /// Replicate generation service
    #[serde(default)]
    pub replicate: ReplicateSettings,
}

/// Replicate generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub api_token: String,

    #[serde(default = "default_replicate_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub image_model: String,

    #[serde(default)]
    pub model_3d: String,

    #[serde(default)]
    pub sfx_model: String,

    #[serde(default)]
    pub music_model: String,

    #[serde(default)]
    pub speech_model: String,

    #[serde(default)]
    pub video_model: String,

    /// Root folder for downloaded outputs; defaults to `<workspace>/Generated`
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl Default for ReplicateSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_token: String::new(),
            api_url: default_replicate_api_url(),
            image_model: String::new(),
            model_3d: String::new(),
            sfx_model: String::new(),
            music_model: String::new(),
            speech_model: String::new(),
            video_model: String::new(),
            staging_dir: None,
        }
    }
}

fn default_api_endpoint() -> String {
    "https://api.openai.com/v1/responses".to_string()
}

fn default_model() -> String {
    "gpt-5.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_tool_iterations() -> usize {
    25
}

fn default_max_tool_result_size() -> usize {
    10_000
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_execution_timeout_secs() -> u64 {
    30
}

fn default_workspace() -> PathBuf {
    config_dir().join("workspace")
}

fn default_python_program() -> String {
    "python3".to_string()
}

fn default_replicate_api_url() -> String {
    "https://api.replicate.com/v1/predictions".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            base_url_override: String::new(),
            api_key: String::new(),
            model: default_model(),
            provider_mode: None,
            enable_python_execution: true,
            enable_viewport_screenshot: true,
            enable_scene_query: true,
            enable_reflection_query: true,
            enable_web_search: true,
            file_search_vector_store_ids: Vec::new(),
            max_tool_iterations: default_max_tool_iterations(),
            max_tool_result_size: default_max_tool_result_size(),
            request_timeout_secs: default_request_timeout_secs(),
            execution_timeout_secs: default_execution_timeout_secs(),
            repeat_policy: RepeatPolicy::default(),
            policy_hints: true,
            workspace: default_workspace(),
            python_program: default_python_program(),
            scene_snapshot: None,
            replicate: ReplicateSettings::default(),
        }
    }
}

impl Settings {
    /// URL requests are sent to, after applying the base URL override.
    pub fn effective_url(&self) -> String {
        let base = self.base_url_override.trim();
        if base.is_empty() {
            return self.api_endpoint.clone();
        }

        let base = base.trim_end_matches('/');
        let path = match url::Url::parse(&self.api_endpoint) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => self.api_endpoint.clone(),
        };

        if path.is_empty() || path == "/" {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// Wire dialect, derived once from the effective URL unless forced.
    pub fn provider_mode(&self) -> ProviderMode {
        self.provider_mode
            .unwrap_or_else(|| ProviderMode::from_endpoint(&self.effective_url()))
    }

    /// API key from the config file, falling back to the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.trim().to_string());
        }
        std::env::var(API_KEY_ENV)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }

    /// Iteration cap, never below one.
    pub fn iteration_cap(&self) -> usize {
        self.max_tool_iterations.max(1)
    }

    /// Root folder for generated downloads.
    pub fn staging_dir(&self) -> PathBuf {
        self.replicate
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.workspace.join("Generated"))
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".editorgpt")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from the default location
pub fn load() -> Result<Settings> {
    load_from(&config_path())
}

/// Load configuration from a specific file
pub fn load_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Config not found at {:?}. Run 'editorgpt init' first.",
            path
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    Ok(settings)
}

/// Save configuration to the default location
pub fn save(settings: &Settings) -> Result<()> {
    save_to(settings, &config_path())
}

/// Save configuration to a specific file
pub fn save_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Write a default config and create the workspace.
///
/// An existing config file is left untouched.
pub fn init() -> Result<Settings> {
    let path = config_path();
    let settings = if path.exists() {
        load_from(&path)?
    } else {
        let settings = Settings::default();
        save_to(&settings, &path)?;
        settings
    };

    std::fs::create_dir_all(&settings.workspace)?;
    Ok(settings)
}
