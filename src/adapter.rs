//! The engine adapter: one chat interface over interchangeable engines.
//!
//! The adapter owns at most one live engine together with the id of the
//! model it was built for. `chat` builds (or rebuilds) the engine on demand
//! when the requested model differs from the loaded one, then drives either
//! a streamed or a one-shot completion and reports the outcome through the
//! caller's callbacks.
//!
//! `chat` and `init_model` are serialized per adapter by an internal call
//! gate. `clear` never waits on the gate: a call already in flight keeps its
//! own reference to the engine and finishes normally.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{
    ChatApi, ChatOptions, ModelConfig, ModelDescriptor, ProviderInfo, UpdateCallback, Usage,
};
use crate::catalog::{ModelCatalog, StaticCatalog};
use crate::config::{BackendKind, Config};
use crate::engine::local::LocalEngineFactory;
use crate::engine::remote::RemoteEngineFactory;
use crate::engine::worker::WorkerEngineFactory;
use crate::engine::{EngineFactory, EngineHandle, EngineOptions, GenerationParams, ProgressEvent};
use crate::error::{AdapterError, EngineInitError};

/// The loaded model and its engine. Both exist or neither does.
#[derive(Default)]
struct AdapterState {
    current: Option<(String, Arc<dyn EngineHandle>)>,
}

/// Chat adapter over a single [`EngineFactory`].
pub struct EngineAdapter {
    factory: Arc<dyn EngineFactory>,
    catalog: Arc<dyn ModelCatalog>,
    provider: ProviderInfo,
    state: Mutex<AdapterState>,
    gate: tokio::sync::Mutex<()>,
}

impl EngineAdapter {
    /// Create an adapter with no engine loaded.
    pub fn new(factory: Arc<dyn EngineFactory>, catalog: Arc<dyn ModelCatalog>) -> Self {
        Self {
            factory,
            catalog,
            provider: ProviderInfo::huggingface(),
            state: Mutex::new(AdapterState::default()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Build an adapter for the backend selected in `config`.
    pub fn from_config(config: &Config) -> Result<Self, EngineInitError> {
        let catalog: Arc<dyn ModelCatalog> =
            Arc::new(StaticCatalog::from_records_or_prebuilt(&config.catalog));

        let factory: Arc<dyn EngineFactory> = match config.adapter.backend {
            BackendKind::Local => Arc::new(LocalEngineFactory::new(
                catalog.clone(),
                config.local.clone(),
            )),
            BackendKind::Worker => {
                let local = LocalEngineFactory::new(catalog.clone(), config.local.clone());
                Arc::new(WorkerEngineFactory::new(
                    Arc::new(local),
                    config.worker.clone(),
                ))
            }
            BackendKind::Remote => Arc::new(RemoteEngineFactory::from_config(&config.remote)?),
        };

        info!(backend = factory.name(), provider = config.adapter.provider.id, "Adapter configured");

        Ok(Self::new(factory, catalog).with_provider(config.adapter.provider.clone()))
    }

    /// Provider identity attached to every model returned by [`Self::models`].
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderInfo) -> Self {
        self.provider = provider;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, AdapterState> {
        // State is a plain value swap; a panic elsewhere cannot leave it half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The model the held engine was built for.
    pub fn current_model(&self) -> Option<String> {
        self.lock_state().current.as_ref().map(|(id, _)| id.clone())
    }

    /// Whether an engine is loaded.
    pub fn is_loaded(&self) -> bool {
        self.lock_state().current.is_some()
    }

    fn engine_for(&self, model_id: &str) -> Option<Arc<dyn EngineHandle>> {
        match &self.lock_state().current {
            Some((id, engine)) if id == model_id => Some(engine.clone()),
            _ => None,
        }
    }

    /// Release the held engine. The next `chat` rebuilds one whatever model it asks for.
    pub fn clear(&self) {
        let previous = self.lock_state().current.take();
        if let Some((model, _)) = previous {
            debug!(model, "Engine released");
        }
    }

    /// Build an engine for `config.model`, forwarding load progress to `on_update`.
    ///
    /// On failure the adapter is left with no engine loaded.
    pub async fn init_model(
        &self,
        config: &ModelConfig,
        on_update: Option<&mut UpdateCallback>,
    ) -> Result<(), AdapterError> {
        let _gate = self.gate.lock().await;
        self.load(config, on_update).await.map(|_| ())
    }

    /// Construct and commit a new engine. Caller holds the gate.
    async fn load(
        &self,
        config: &ModelConfig,
        mut on_update: Option<&mut UpdateCallback>,
    ) -> Result<Arc<dyn EngineHandle>, AdapterError> {
        // Drop the old engine before building the next one.
        let previous = self.lock_state().current.take();
        drop(previous);

        // Progress is not incremental text: the same line is both partial and delta.
        let mut forward = |event: &ProgressEvent| {
            if let Some(cb) = on_update.as_deref_mut() {
                cb(&event.text, &event.text);
            }
        };
        let options = EngineOptions::new(GenerationParams::from(config), config.cache)
            .with_progress(&mut forward);

        info!(model = config.model, backend = self.factory.name(), "Initializing engine");

        match self.factory.construct(&config.model, options).await {
            Ok(engine) => {
                self.lock_state().current = Some((config.model.clone(), engine.clone()));
                info!(model = config.model, "Engine ready");
                Ok(engine)
            }
            Err(e) => {
                warn!(model = config.model, error = %e, "Engine initialization failed");
                Err(e.into())
            }
        }
    }

    /// Run one chat completion.
    ///
    /// Initializes the engine first if `options.config.model` is not the
    /// loaded model. Callback order is zero or more `on_update` followed by
    /// exactly one of `on_finish` / `on_error`. Initialization and engine
    /// failures return `Err` and fire no terminal callback; an empty reply
    /// goes to `on_error` and returns `Ok`.
    pub async fn chat(&self, options: ChatOptions) -> Result<(), AdapterError> {
        let ChatOptions {
            config,
            messages,
            mut on_update,
            on_finish,
            on_error,
        } = options;
        let request_id = Uuid::new_v4().to_string();

        let _gate = self.gate.lock().await;

        let engine = match self.engine_for(&config.model) {
            Some(engine) => engine,
            None => self.load(&config, on_update.as_mut()).await?,
        };

        info!(
            request_id = request_id,
            model = config.model,
            messages = messages.len(),
            stream = config.stream,
            "Chat completion request"
        );

        let reply = if config.stream {
            let mut stream = engine.complete_streaming(&messages).await?;
            let mut reply = String::new();
            let mut chunks = 0usize;

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if let Some(delta) = chunk.content() {
                    reply.push_str(delta);
                    chunks += 1;
                    if let Some(cb) = on_update.as_mut() {
                        cb(&reply, delta);
                    }
                }
            }

            debug!(request_id = request_id, chunks, "Stream complete");
            Some(reply)
        } else {
            engine.complete_once(&messages).await?.content
        };

        match reply.filter(|r| !r.is_empty()) {
            Some(reply) => {
                info!(request_id = request_id, chars = reply.len(), "Chat completion finished");
                on_finish(reply);
            }
            None => {
                warn!(request_id = request_id, model = config.model, "Empty response generated by LLM");
                if let Some(on_error) = on_error {
                    on_error(AdapterError::EmptyResponse);
                }
            }
        }

        Ok(())
    }

    /// Usage stub.
    pub fn usage(&self) -> Usage {
        Usage { used: 0, total: 0 }
    }

    /// Every catalog model, marked available, under this adapter's provider.
    pub fn models(&self) -> Vec<ModelDescriptor> {
        self.catalog
            .list_models()
            .into_iter()
            .map(|record| ModelDescriptor {
                name: record.model_id,
                available: true,
                provider: self.provider.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ChatApi for EngineAdapter {
    fn clear(&self) {
        EngineAdapter::clear(self)
    }

    async fn init_model(
        &self,
        config: &ModelConfig,
        on_update: Option<&mut UpdateCallback>,
    ) -> Result<(), AdapterError> {
        EngineAdapter::init_model(self, config, on_update).await
    }

    async fn chat(&self, options: ChatOptions) -> Result<(), AdapterError> {
        EngineAdapter::chat(self, options).await
    }

    async fn usage(&self) -> Usage {
        EngineAdapter::usage(self)
    }

    async fn models(&self) -> Vec<ModelDescriptor> {
        EngineAdapter::models(self)
    }
}
