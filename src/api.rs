//! Caller-facing chat API shared by every backend.
//!
//! [`ChatApi`] is the one interface an application talks to. The
//! [`crate::adapter::EngineAdapter`] implements it over any
//! [`crate::engine::EngineFactory`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

/// Where an engine keeps downloaded weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Weights live only as long as the engine.
    #[default]
    Memory,
    /// Weights are persisted in durable local storage and reused.
    Durable,
}

/// Model identity plus generation parameters for one chat call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier.
    pub model: String,

    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f64,

    /// Top-p (nucleus) sampling threshold.
    pub top_p: f64,

    pub presence_penalty: f64,

    pub frequency_penalty: f64,

    /// Maximum tokens to generate (engine default when unset).
    pub max_tokens: Option<usize>,

    /// Deliver the reply incrementally through `on_update`.
    pub stream: bool,

    /// Weight cache mode.
    pub cache: CacheMode,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "Llama-3-8B-Instruct-q4f32_1-MLC".to_string(),
            temperature: 0.7,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            max_tokens: None,
            stream: true,
            cache: CacheMode::Memory,
        }
    }
}

impl ModelConfig {
    /// Default generation settings for `model`.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }
}

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Receives `(partial, delta)`: the text accumulated so far and the newest fragment.
pub type UpdateCallback = Box<dyn FnMut(&str, &str) + Send>;

/// Receives the full reply. Fires at most once.
pub type FinishCallback = Box<dyn FnOnce(String) + Send>;

/// Receives a generation failure. Fires at most once.
pub type ErrorCallback = Box<dyn FnOnce(AdapterError) + Send>;

/// A single chat request with its lifecycle callbacks.
///
/// For one `chat` call the callbacks fire as zero or more `on_update`
/// followed by exactly one of `on_finish` or `on_error`. Without an
/// `on_error`, an empty reply produces no terminal callback at all.
pub struct ChatOptions {
    pub config: ModelConfig,
    pub messages: Vec<ChatMessage>,
    pub on_update: Option<UpdateCallback>,
    pub on_finish: FinishCallback,
    pub on_error: Option<ErrorCallback>,
}

impl ChatOptions {
    pub fn new(
        config: ModelConfig,
        messages: Vec<ChatMessage>,
        on_finish: impl FnOnce(String) + Send + 'static,
    ) -> Self {
        Self {
            config,
            messages,
            on_update: None,
            on_finish: Box::new(on_finish),
            on_error: None,
        }
    }

    #[must_use]
    pub fn on_update(mut self, f: impl FnMut(&str, &str) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl FnOnce(AdapterError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for ChatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOptions")
            .field("config", &self.config)
            .field("messages", &self.messages.len())
            .field("on_update", &self.on_update.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Usage report. Not backed by real accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub used: u64,
    pub total: u64,
}

/// Identity of the party serving a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub provider_name: String,
    pub provider_type: String,
}

impl ProviderInfo {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            provider_name: id.clone(),
            provider_type: id.clone(),
            id,
        }
    }

    pub fn huggingface() -> Self {
        Self::new("huggingface")
    }
}

/// A model as presented to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub available: bool,
    pub provider: ProviderInfo,
}

/// Backend-agnostic chat interface.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Release the loaded engine. The next `chat` builds a new one.
    fn clear(&self);

    /// Build an engine for `config.model`, forwarding load progress to
    /// `on_update` as `(text, text)`. On failure no engine stays loaded.
    async fn init_model(
        &self,
        config: &ModelConfig,
        on_update: Option<&mut UpdateCallback>,
    ) -> Result<(), AdapterError>;

    /// Run one chat completion, reporting progress and outcome through the
    /// callbacks in `options`.
    ///
    /// Returns `Err` for engine initialization and transport failures. An
    /// empty reply is delivered to `on_error` and still returns `Ok`.
    async fn chat(&self, options: ChatOptions) -> Result<(), AdapterError>;

    async fn usage(&self) -> Usage;

    async fn models(&self) -> Vec<ModelDescriptor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_mode_serde() {
        let json = serde_json::to_string(&CacheMode::Durable).unwrap();
        assert_eq!(json, "\"durable\"");
        let mode: CacheMode = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(mode, CacheMode::Memory);
    }

    #[test]
    fn test_message_serializes_openai_shape() {
        let msg = ChatMessage::user("hi");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, serde_json::json!({ "role": "user", "content": "hi" }));
    }

    #[test]
    fn test_provider_info() {
        let p = ProviderInfo::huggingface();
        assert_eq!(p.id, "huggingface");
        assert_eq!(p.provider_name, "huggingface");
        assert_eq!(p.provider_type, "huggingface");
    }
}
