//! Replicate tool - generate images, video, audio and 3D files

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::Result;
use crate::config::ReplicateSettings;
use crate::error::Error;
use super::{Capability, Tool, ToolClass};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_DURATION: Duration = Duration::from_secs(300);

/// Kind of file a prediction is expected to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Image,
    Video,
    Audio,
    Model3d,
    Other,
}

impl OutputKind {
    pub fn parse(kind: &str) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "" | "image" => OutputKind::Image,
            "video" => OutputKind::Video,
            "audio" => OutputKind::Audio,
            "3d" | "3d_model" | "model" | "mesh" => OutputKind::Model3d,
            _ => OutputKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Image => "image",
            OutputKind::Video => "video",
            OutputKind::Audio => "audio",
            OutputKind::Model3d => "3d",
            OutputKind::Other => "other",
        }
    }

    /// Staging sub-folder for downloads of this kind
    pub fn staging_folder(&self) -> &'static str {
        match self {
            OutputKind::Image => "Images",
            OutputKind::Video => "Video",
            OutputKind::Audio => "Audio",
            OutputKind::Model3d => "Models",
            OutputKind::Other => "Misc",
        }
    }

    fn default_extension(&self) -> &'static str {
        match self {
            OutputKind::Image => "png",
            OutputKind::Video => "mp4",
            OutputKind::Audio => "wav",
            OutputKind::Model3d => "glb",
            OutputKind::Other => "bin",
        }
    }
}

/// Model configured for a kind; audio picks by subkind, defaulting to sound effects.
pub fn resolve_model(settings: &ReplicateSettings, kind: OutputKind, subkind: &str) -> String {
    match kind {
        OutputKind::Image => settings.image_model.clone(),
        OutputKind::Video => settings.video_model.clone(),
        OutputKind::Model3d => settings.model_3d.clone(),
        OutputKind::Audio => match subkind.trim().to_lowercase().as_str() {
            "music" => settings.music_model.clone(),
            "speech" | "voice" | "tts" => settings.speech_model.clone(),
            _ => settings.sfx_model.clone(),
        },
        OutputKind::Other => String::new(),
    }
}

/// Every http(s) URL found in a prediction's `output`, in order.
pub fn collect_output_urls(output: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    collect_into(output, &mut urls);
    urls
}

fn collect_into(value: &Value, urls: &mut Vec<String>) {
    match value {
        Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => {
            if !urls.contains(s) {
                urls.push(s.clone());
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_into(item, urls)),
        Value::Object(map) => map.values().for_each(|item| collect_into(item, urls)),
        _ => {}
    }
}

fn extension_for(url: &str, kind: OutputKind) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            Path::new(parsed.path())
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
        })
        .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        .unwrap_or_else(|| kind.default_extension().to_string())
}

fn mime_type_for(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "glb" => "model/gltf-binary",
        "gltf" => "model/gltf+json",
        "obj" => "model/obj",
        _ => "application/octet-stream",
    }
}

/// Endpoint and body for creating a prediction.
///
/// An `owner/name` slug on a `/v1/predictions` endpoint goes to that model's own
/// predictions endpoint without a `version` field; anything else is sent as `version`.
pub fn prediction_request(
    api_url: &str,
    model: &str,
    prompt: &str,
    kind: OutputKind,
) -> (String, Value) {
    let mut input = json!({"prompt": prompt});
    if kind == OutputKind::Image {
        input["output_format"] = json!("png");
    }

    let api_url = api_url.trim_end_matches('/');
    match api_url.strip_suffix("/v1/predictions") {
        Some(base) if model.contains('/') => {
            let url = format!("{}/v1/models/{}/predictions", base, model);
            (url, json!({"input": input}))
        }
        _ => (api_url.to_string(), json!({"version": model, "input": input})),
    }
}

fn error_result(message: impl Into<String>) -> String {
    json!({"status": "error", "message": message.into()}).to_string()
}

/// Generate content through Replicate predictions
pub struct ReplicateTool {
    settings: ReplicateSettings,
    staging_dir: PathBuf,
    client: Client,
}

impl ReplicateTool {
    pub fn new(settings: ReplicateSettings, staging_dir: PathBuf) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { settings, staging_dir, client })
    }

    async fn create_prediction(
        &self,
        model: &str,
        prompt: &str,
        kind: OutputKind,
    ) -> Result<Value> {
        let (url, body) = prediction_request(&self.settings.api_url, model, prompt, kind);
        debug!("Creating Replicate prediction at {}", url);

        let response = self.client
            .post(&url)
            .bearer_auth(&self.settings.api_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let message = format!("Replicate returned HTTP {}: {}", status.as_u16(), text);
            return Err(Error::Tool(message));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn wait_for_prediction(&self, mut prediction: Value) -> Result<Value> {
        let started = Instant::now();

        loop {
            let status = prediction.get("status").and_then(Value::as_str).unwrap_or("").to_string();
            match status.as_str() {
                "succeeded" => return Ok(prediction),
                "failed" | "canceled" => {
                    let detail = prediction.get("error")
                        .filter(|e| !e.is_null())
                        .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                        .unwrap_or_else(|| "no error detail".to_string());
                    return Err(Error::Tool(format!("Replicate prediction {}: {}", status, detail)));
                }
                _ => {}
            }

            if started.elapsed() >= MAX_POLL_DURATION {
                return Err(Error::Tool(format!(
                    "Replicate prediction did not finish within {} seconds",
                    MAX_POLL_DURATION.as_secs()
                )));
            }

            let poll_url = prediction.pointer("/urls/get")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Tool("Replicate prediction has no status URL".to_string()))?
                .to_string();

            tokio::time::sleep(POLL_INTERVAL).await;
            debug!("Polling Replicate prediction ({})", status);

            let response = self.client
                .get(&poll_url)
                .bearer_auth(&self.settings.api_token)
                .send()
                .await?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                return Err(Error::Tool(format!("Replicate poll returned HTTP {}", status)));
            }
            prediction = response.json().await?;
        }
    }

    async fn download(&self, url: &str, kind: OutputKind) -> Result<Value> {
        let folder = self.staging_dir.join(kind.staging_folder());
        tokio::fs::create_dir_all(&folder).await?;

        let extension = extension_for(url, kind);
        let path = folder.join(format!("{}.{}", Uuid::new_v4().simple(), extension));

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(Error::Tool(format!("Download of {} returned HTTP {}", url, status)));
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(&path, &bytes).await?;

        Ok(json!({
            "local_path": path.to_string_lossy(),
            "mime_type": mime_type_for(&extension),
            "description": format!("Generated {} downloaded from {}", kind.as_str(), url)
        }))
    }
}

#[async_trait]
impl Tool for ReplicateTool {
    fn name(&self) -> &str { "replicate_generate" }

    fn description(&self) -> &str {
        "Generate an image, video, audio clip or 3D model with Replicate and download the outputs \
         into the staging folder. Returns JSON whose details.files lists the local paths to import."
    }

    fn capability(&self) -> Capability { Capability::Asynchronous }

    fn class(&self) -> ToolClass { ToolClass::Generation }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "What to generate"
                },
                "version": {
                    "type": "string",
                    "description": "Replicate model or version to use instead of the configured default"
                },
                "output_kind": {
                    "type": "string",
                    "enum": ["image", "video", "audio", "3d"],
                    "description": "Kind of output (default image)"
                },
                "output_subkind": {
                    "type": "string",
                    "enum": ["sfx", "music", "speech"],
                    "description": "Audio flavour used to pick the configured audio model"
                }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let prompt = match params.get("prompt").and_then(Value::as_str).map(str::trim) {
            Some(prompt) if !prompt.is_empty() => prompt,
            _ => return Ok(error_result("Missing 'prompt' parameter")),
        };

        if self.settings.api_token.trim().is_empty() {
            return Ok(error_result("Replicate API token is not configured"));
        }

        let kind_name = params.get("output_kind").and_then(Value::as_str).unwrap_or("");
        let kind = OutputKind::parse(kind_name);
        let subkind = params.get("output_subkind").and_then(Value::as_str).unwrap_or("");
        let model = match params.get("version").and_then(Value::as_str).map(str::trim) {
            Some(version) if !version.is_empty() => version.to_string(),
            _ => resolve_model(&self.settings, kind, subkind),
        };
        if model.is_empty() {
            return Ok(error_result(format!(
                "No Replicate model configured for output kind '{}'; pass 'version' explicitly",
                kind.as_str()
            )));
        }

        info!("Starting Replicate prediction with {} ({})", model, kind.as_str());
        let prediction = self.create_prediction(&model, prompt, kind).await?;
        let prediction = self.wait_for_prediction(prediction).await?;

        let urls = collect_output_urls(prediction.get("output").unwrap_or(&Value::Null));
        if urls.is_empty() {
            return Ok(error_result(
                "Replicate prediction succeeded but produced no downloadable output",
            ));
        }

        let mut files = Vec::with_capacity(urls.len());
        for url in &urls {
            match self.download(url, kind).await {
                Ok(file) => files.push(file),
                Err(e) => warn!("Skipping Replicate output {}: {}", url, e),
            }
        }
        if files.is_empty() {
            return Ok(error_result("Replicate outputs could not be downloaded"));
        }

        Ok(json!({
            "status": "success",
            "message": format!(
                "Replicate prediction succeeded with {} downloaded file(s).",
                files.len()
            ),
            "details": {
                "provider": "replicate",
                "output_kind": kind.as_str(),
                "files": files
            }
        }).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings() -> ReplicateSettings {
        ReplicateSettings {
            enabled: true,
            image_model: "black-forest-labs/flux-dev".to_string(),
            model_3d: "firtoz/trellis".to_string(),
            sfx_model: "sfx/model".to_string(),
            music_model: "meta/musicgen".to_string(),
            speech_model: "speech/model".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_output_kind_aliases() {
        assert_eq!(OutputKind::parse(""), OutputKind::Image);
        assert_eq!(OutputKind::parse("Mesh"), OutputKind::Model3d);
        assert_eq!(OutputKind::parse("3d_model"), OutputKind::Model3d);
        assert_eq!(OutputKind::parse("hologram"), OutputKind::Other);
        assert_eq!(OutputKind::Model3d.staging_folder(), "Models");
    }

    #[test]
    fn test_resolve_model() {
        let settings = settings();
        assert_eq!(resolve_model(&settings, OutputKind::Image, ""), "black-forest-labs/flux-dev");
        assert_eq!(resolve_model(&settings, OutputKind::Audio, "music"), "meta/musicgen");
        assert_eq!(resolve_model(&settings, OutputKind::Audio, ""), "sfx/model");
        assert_eq!(resolve_model(&settings, OutputKind::Video, ""), "");
    }

    #[test]
    fn test_prediction_request_routes_model_slugs() {
        let default_url = "https://api.replicate.com/v1/predictions";

        let (url, body) =
            prediction_request(default_url, "black-forest-labs/flux-dev", "a rock", OutputKind::Image);
        assert_eq!(url, "https://api.replicate.com/v1/models/black-forest-labs/flux-dev/predictions");
        assert!(body.get("version").is_none());
        assert_eq!(body["input"], json!({"prompt": "a rock", "output_format": "png"}));

        let (url, body) = prediction_request(default_url, "5c7d5dc6dd8bf75c", "rain", OutputKind::Audio);
        assert_eq!(url, default_url);
        assert_eq!(body["version"], "5c7d5dc6dd8bf75c");
        assert_eq!(body["input"], json!({"prompt": "rain"}));

        let proxy = "https://proxy.example.com/replicate";
        let (url, body) = prediction_request(proxy, "firtoz/trellis", "a chair", OutputKind::Model3d);
        assert_eq!(url, proxy);
        assert_eq!(body["version"], "firtoz/trellis");
    }

    #[test]
    fn test_collect_output_urls() {
        let output = json!({
            "mesh": "https://replicate.delivery/a/model.glb",
            "previews": ["https://replicate.delivery/a/front.png", "not a url", 3],
            "again": "https://replicate.delivery/a/model.glb"
        });
        let urls = collect_output_urls(&output);
        assert_eq!(urls.len(), 2);
        assert!(urls.contains(&"https://replicate.delivery/a/front.png".to_string()));
    }

    #[test]
    fn test_extension_and_mime() {
        assert_eq!(extension_for("https://x.test/out/file.GLB?sig=1", OutputKind::Model3d), "glb");
        assert_eq!(extension_for("https://x.test/out/file", OutputKind::Audio), "wav");
        assert_eq!(mime_type_for("jpg"), "image/jpeg");
    }

    #[tokio::test]
    async fn test_execute_validates_before_network() {
        let tmp = TempDir::new().unwrap();
        let tool = ReplicateTool::new(settings(), tmp.path().to_path_buf()).unwrap();

        let missing_prompt: Value = serde_json::from_str(&tool.execute(json!({})).await.unwrap()).unwrap();
        assert_eq!(missing_prompt["status"], "error");

        let no_token: Value = serde_json::from_str(
            &tool.execute(json!({"prompt": "a rock"})).await.unwrap(),
        ).unwrap();
        assert_eq!(no_token["status"], "error");
        assert!(no_token["message"].as_str().unwrap().contains("token"));
    }

    #[tokio::test]
    async fn test_execute_requires_model_for_kind() {
        let tmp = TempDir::new().unwrap();
        let mut settings = settings();
        settings.api_token = "r8_test".to_string();
        let tool = ReplicateTool::new(settings, tmp.path().to_path_buf()).unwrap();

        let result: Value = serde_json::from_str(
            &tool.execute(json!({"prompt": "waves", "output_kind": "video"})).await.unwrap(),
        ).unwrap();
        assert_eq!(result["status"], "error");
        assert!(result["message"].as_str().unwrap().contains("video"));
    }
}
