//! Runtime configuration for the engine adapter.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Backend selection, per-backend knobs, generation defaults and the model
//! catalog all live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::api::{ModelConfig, ProviderInfo};
use crate::catalog::CatalogRecord;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "engine-adapter", about = "Chat with any configured LLM engine")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Model to chat with (defaults to the configured generation model).
    #[arg(short, long)]
    pub model: Option<String>,

    /// User prompt.
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Optional system prompt prepended to the conversation.
    #[arg(long)]
    pub system: Option<String>,

    /// Disable streaming and wait for the full reply.
    #[arg(long)]
    pub no_stream: bool,

    /// List catalog models and exit.
    #[arg(long)]
    pub list_models: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Adapter configuration.
    pub adapter: AdapterConfig,

    /// Generation defaults used when a caller does not supply its own.
    pub generation: ModelConfig,

    /// In-process engine settings.
    pub local: LocalConfig,

    /// Worker-hosted engine settings.
    pub worker: WorkerConfig,

    /// Remote provider settings.
    pub remote: RemoteConfig,

    /// Models known to the catalog, in display order.
    pub catalog: Vec<CatalogRecord>,
}

/// Which engine implementation backs the adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Engine runs inside the calling task.
    #[default]
    Local,
    /// Local engine hosted on a dedicated worker task.
    Worker,
    /// OpenAI-compatible HTTP provider.
    Remote,
}

/// Adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Engine backend.
    pub backend: BackendKind,

    /// Provider identity attached to every model returned by `models()`.
    pub provider: ProviderInfo,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            provider: ProviderInfo::huggingface(),
        }
    }
}

/// In-process engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory for durably cached weights (`CacheMode::Durable`).
    pub cache_dir: PathBuf,

    /// Device label reported when loading finishes.
    pub device: String,

    /// Number of weight shards to report while loading.
    pub shards: usize,

    /// Bytes per synthesized weight shard.
    pub shard_bytes: usize,

    /// Delay between generated tokens in milliseconds (0 = no delay).
    pub token_delay_ms: u64,

    /// Capacity of the token channel between the decode loop and the caller.
    pub channel_capacity: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/llm-engine-adapter"),
            device: "cpu".to_string(),
            shards: 4,
            shard_bytes: 4096,
            token_delay_ms: 0,
            channel_capacity: 32,
        }
    }
}

impl LocalConfig {
    pub fn token_delay(&self) -> Option<Duration> {
        (self.token_delay_ms > 0).then(|| Duration::from_millis(self.token_delay_ms))
    }
}

/// Worker-hosted engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Capacity of the command channel into the worker.
    pub command_capacity: usize,

    /// Capacity of per-request reply channels out of the worker.
    pub reply_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command_capacity: 16,
            reply_capacity: 32,
        }
    }
}

/// Remote provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL including the version prefix (e.g. "https://api.openai.com/v1").
    pub base_url: String,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Check that the model exists via `GET /models` when constructing the engine.
    pub verify_model: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
            verify_model: true,
        }
    }
}

impl RemoteConfig {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Generation settings for `model`, or the configured default model.
    pub fn model_config(&self, model: Option<&str>, stream: bool) -> ModelConfig {
        let mut config = self.generation.clone();
        if let Some(model) = model {
            config.model = model.to_string();
        }
        config.stream = stream;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.adapter.backend, BackendKind::Local);
        assert_eq!(cfg.adapter.provider.id, "huggingface");
        assert_eq!(cfg.worker.command_capacity, 16);
        assert!(cfg.remote.verify_model);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "adapter": { "backend": "remote" },
            "remote": { "base_url": "http://localhost:11434/v1" },
            "generation": { "model": "llama3", "temperature": 0.2 }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.adapter.backend, BackendKind::Remote);
        assert_eq!(cfg.remote.base_url, "http://localhost:11434/v1");
        assert_eq!(cfg.remote.timeout_secs, 60);
        assert_eq!(cfg.generation.model, "llama3");
        assert_eq!(cfg.generation.temperature, 0.2);
        assert_eq!(cfg.generation.top_p, ModelConfig::default().top_p);
        assert!(cfg.catalog.is_empty());
    }

    #[test]
    fn test_model_config_override() {
        let cfg = Config::default();
        let mc = cfg.model_config(Some("other"), false);
        assert_eq!(mc.model, "other");
        assert!(!mc.stream);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(cfg.local.shards, 4);
    }
}
