//! In-process inference engine.
//!
//! The engine is constructed per model:
//! 1. Resolves the model in the catalog
//! 2. Loads weight shards (from the durable cache when enabled)
//! 3. Reports loading progress to the caller
//!
//! Completions run a stub decode loop on a spawned task and stream tokens
//! through a bounded channel.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::api::{CacheMode, ChatMessage, Role};
use crate::catalog::ModelCatalog;
use crate::config::LocalConfig;
use crate::engine::weight_cache::WeightCache;
use crate::engine::{
    ChunkStream, Completion, EngineFactory, EngineHandle, EngineOptions, GenerationParams,
    ProgressEvent, StreamChunk,
};
use crate::error::{EngineError, EngineInitError};

/// Token budget when the caller does not set `max_tokens`.
const DEFAULT_MAX_TOKENS: usize = 256;

/// Builds [`LocalEngine`]s for models listed in the catalog.
pub struct LocalEngineFactory {
    catalog: Arc<dyn ModelCatalog>,
    config: LocalConfig,
}

impl LocalEngineFactory {
    pub fn new(catalog: Arc<dyn ModelCatalog>, config: LocalConfig) -> Self {
        Self { catalog, config }
    }

    /// Load all shards for `model_id`, reporting progress per shard.
    async fn load_weights(
        &self,
        model_id: &str,
        options: &mut EngineOptions<'_>,
        start: Instant,
    ) -> Result<Vec<u8>, EngineInitError> {
        let shards = self.config.shards.max(1);
        let shard_bytes = self.config.shard_bytes;
        let mut cache = match options.cache_mode {
            CacheMode::Durable => Some(WeightCache::open(self.config.cache_dir.clone()).await?),
            CacheMode::Memory => None,
        };

        let mut weights = Vec::with_capacity(shards * shard_bytes);
        for shard in 0..shards {
            let (data, verb) = match cache.as_mut() {
                Some(c) => match Self::read_cached(c, model_id, shard, shard_bytes).await {
                    Some(data) => (data, "Loading model from cache"),
                    None => {
                        let data = synthesize_shard(model_id, shard, shard_bytes);
                        c.write_shard(model_id, shard, &data).await?;
                        (data, "Fetching param cache")
                    }
                },
                None => (
                    synthesize_shard(model_id, shard, shard_bytes),
                    "Fetching param cache",
                ),
            };
            weights.extend_from_slice(&data);

            let progress = (shard + 1) as f64 / shards as f64;
            let elapsed = start.elapsed().as_secs_f64();
            options.report(&ProgressEvent::new(
                format!(
                    "{verb}[{}/{shards}]: {}KB loaded. {:.0}% completed, {:.0} secs elapsed.",
                    shard + 1,
                    weights.len() / 1024,
                    progress * 100.0,
                    elapsed,
                ),
                progress,
                elapsed,
            ));
        }

        if let Some(c) = cache.as_ref() {
            let stats = c.stats();
            debug!(
                model = model_id,
                shards_read = stats.shards_read,
                shards_written = stats.shards_written,
                bytes_read = stats.bytes_read,
                bytes_written = stats.bytes_written,
                "Weight cache transfer"
            );
        }

        Ok(weights)
    }

    /// A cached shard, or `None` when it is missing. A shard that fails to
    /// decode or has the wrong size evicts the model's cache so every shard
    /// is refetched; shards already loaded this run are written back.
    async fn read_cached(
        cache: &mut WeightCache,
        model_id: &str,
        shard: usize,
        shard_bytes: usize,
    ) -> Option<Vec<u8>> {
        if !cache.contains(model_id, shard).await {
            return None;
        }

        match cache.read_shard(model_id, shard).await {
            Ok(data) if data.len() == shard_bytes => return Some(data),
            Ok(data) => warn!(model = model_id, shard, len = data.len(), "Cached shard has wrong size"),
            Err(e) => warn!(model = model_id, shard, error = %e, "Cached shard unreadable"),
        }

        if let Err(e) = cache.evict(model_id).await {
            warn!(model = model_id, error = %e, "Failed to evict weight cache");
            return None;
        }
        for earlier in 0..shard {
            let data = synthesize_shard(model_id, earlier, shard_bytes);
            if let Err(e) = cache.write_shard(model_id, earlier, &data).await {
                warn!(model = model_id, shard = earlier, error = %e, "Failed to rewrite shard");
            }
        }
        None
    }
}

#[async_trait]
impl EngineFactory for LocalEngineFactory {
    fn name(&self) -> &str {
        "local"
    }

    async fn construct(
        &self,
        model_id: &str,
        mut options: EngineOptions<'_>,
    ) -> Result<Arc<dyn EngineHandle>, EngineInitError> {
        let start = Instant::now();

        let record = self
            .catalog
            .find(model_id)
            .ok_or_else(|| EngineInitError::UnsupportedModel(model_id.to_string()))?;

        let weights = self.load_weights(model_id, &mut options, start).await?;

        let elapsed = start.elapsed().as_secs_f64();
        options.report(&ProgressEvent::new(
            format!("Finish loading on {}", self.config.device),
            1.0,
            elapsed,
        ));

        info!(
            model = model_id,
            vram_mb = record.vram_required_mb,
            weight_bytes = weights.len(),
            cache = ?options.cache_mode,
            elapsed_secs = elapsed,
            "Local engine ready"
        );

        Ok(Arc::new(LocalEngine {
            model_id: model_id.to_string(),
            params: options.generation,
            config: self.config.clone(),
        }))
    }
}

/// A model-bound in-process engine.
pub struct LocalEngine {
    model_id: String,
    params: GenerationParams,
    config: LocalConfig,
}

impl LocalEngine {
    /// Run the stub decode loop: the reply restates the last user turn,
    /// one whitespace-delimited token at a time. Returns the tokens and
    /// the finish reason.
    fn decode(&self, messages: &[ChatMessage]) -> (Vec<String>, &'static str) {
        let max_tokens = self.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.trim())
            .unwrap_or("");
        if prompt.is_empty() {
            return (Vec::new(), "stop");
        }

        let mut tokens: Vec<String> = Vec::new();
        for (i, word) in prompt.split_whitespace().enumerate() {
            tokens.push(if i == 0 { word.to_string() } else { format!(" {word}") });
        }

        if tokens.len() > max_tokens {
            tokens.truncate(max_tokens);
            (tokens, "length")
        } else {
            (tokens, "stop")
        }
    }
}

#[async_trait]
impl EngineHandle for LocalEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, EngineError> {
        let (tokens, finish_reason) = self.decode(messages);
        let (tx, rx) =
            mpsc::channel::<Result<StreamChunk, EngineError>>(self.config.channel_capacity.max(1));
        let delay = self.config.token_delay();
        let model_id = self.model_id.clone();

        tokio::spawn(async move {
            let total = tokens.len();
            for token in tokens {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(StreamChunk::text(token))).await.is_err() {
                    // Receiver dropped, stop generating.
                    return;
                }
            }
            let _ = tx.send(Ok(StreamChunk::finished(finish_reason))).await;
            debug!(model = model_id, tokens = total, finish_reason, "Decode loop complete");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<Completion, EngineError> {
        let (tokens, finish_reason) = self.decode(messages);
        let text = tokens.concat();
        Ok(Completion {
            content: (!text.is_empty()).then_some(text),
            finish_reason: Some(finish_reason.to_string()),
        })
    }
}

/// Deterministic stand-in for downloaded weights.
fn synthesize_shard(model_id: &str, shard: usize, len: usize) -> Vec<u8> {
    // FNV-1a over the model id seeds the byte pattern.
    let seed = model_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
    (0..len)
        .map(|i| (seed.rotate_left((shard % 64) as u32) as usize).wrapping_add(i % 251) as u8)
        .collect()
}
