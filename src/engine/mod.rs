//! Inference engine capability.
//!
//! An engine is built per model by an [`EngineFactory`] and serves
//! completions through an [`EngineHandle`]. Backends:
//!
//! - [`local`]: in-process engine with a stub decode loop
//! - [`worker`]: any factory hosted on a dedicated worker task
//! - [`remote`]: OpenAI-compatible HTTP provider
//! - [`weight_cache`]: durable, zstd-compressed weight storage for [`local`]

pub mod local;
pub mod remote;
pub mod weight_cache;
pub mod worker;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::api::{CacheMode, ChatMessage, ModelConfig};
use crate::error::{EngineError, EngineInitError};

/// Lazy, finite, forward-only sequence of completion fragments.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, EngineError>> + Send>>;

/// Initialization progress reported while an engine is being constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Human-readable status line.
    pub text: String,

    /// Fraction complete (0.0 - 1.0).
    pub progress: f64,

    /// Seconds since construction started.
    pub elapsed_secs: f64,
}

impl ProgressEvent {
    pub fn new(text: impl Into<String>, progress: f64, elapsed_secs: f64) -> Self {
        Self {
            text: text.into(),
            progress,
            elapsed_secs,
        }
    }
}

/// One streamed fragment of a completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Newly generated text, if any.
    pub delta: Option<String>,

    /// Set on the final chunk.
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            finish_reason: None,
        }
    }

    pub fn finished(reason: impl Into<String>) -> Self {
        Self {
            delta: None,
            finish_reason: Some(reason.into()),
        }
    }

    /// The delta text when present and non-empty.
    pub fn content(&self) -> Option<&str> {
        self.delta.as_deref().filter(|d| !d.is_empty())
    }
}

/// A non-streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: Option<String>,
    pub finish_reason: Option<String>,
}

/// Sampling parameters fixed at engine construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub max_tokens: Option<usize>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from(&ModelConfig::default())
    }
}

impl From<&ModelConfig> for GenerationParams {
    fn from(config: &ModelConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            presence_penalty: config.presence_penalty,
            frequency_penalty: config.frequency_penalty,
            max_tokens: config.max_tokens,
        }
    }
}

/// Receives every [`ProgressEvent`] during construction.
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(&ProgressEvent) + Send);

/// Everything an engine needs besides the model id.
pub struct EngineOptions<'a> {
    pub generation: GenerationParams,
    pub cache_mode: CacheMode,
    pub on_init_progress: Option<ProgressCallback<'a>>,
}

impl<'a> EngineOptions<'a> {
    pub fn new(generation: GenerationParams, cache_mode: CacheMode) -> Self {
        Self {
            generation,
            cache_mode,
            on_init_progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback<'a>) -> Self {
        self.on_init_progress = Some(callback);
        self
    }

    /// Forward a progress event to the registered callback, if any.
    pub fn report(&mut self, event: &ProgressEvent) {
        if let Some(cb) = self.on_init_progress.as_mut() {
            cb(event);
        }
    }
}

/// Builds a model-bound engine.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Backend name for logs ("local", "worker", "remote").
    fn name(&self) -> &str;

    /// Construct an engine serving `model_id`.
    async fn construct(
        &self,
        model_id: &str,
        options: EngineOptions<'_>,
    ) -> Result<Arc<dyn EngineHandle>, EngineInitError>;
}

/// A live, model-bound engine.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// The model this engine was built for.
    fn model_id(&self) -> &str;

    /// Start a streamed completion over `messages`.
    async fn complete_streaming(&self, messages: &[ChatMessage])
        -> Result<ChunkStream, EngineError>;

    /// Produce a completion in one piece.
    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<Completion, EngineError>;
}
