//! Worker-hosted engine.
//!
//! Each constructed engine gets its own worker task. The caller talks to it
//! only through channels:
//!
//! ```text
//! caller ── Command (mpsc) ──▶ worker ── inner EngineFactory / EngineHandle
//!        ◀── progress (mpsc) ──
//!        ◀── reply (oneshot) / WorkerEvent (mpsc) ──
//! ```
//!
//! A closed channel on either side is a transport failure. Dropping the last
//! [`WorkerEngine`] closes the command channel and the worker exits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::api::{CacheMode, ChatMessage};
use crate::config::WorkerConfig;
use crate::engine::{
    ChunkStream, Completion, EngineFactory, EngineHandle, EngineOptions, GenerationParams,
    ProgressEvent, StreamChunk,
};
use crate::error::{EngineError, EngineInitError};

/// Requests sent into a worker.
enum Command {
    Load {
        model_id: String,
        generation: GenerationParams,
        cache_mode: CacheMode,
        progress: mpsc::UnboundedSender<ProgressEvent>,
        reply: oneshot::Sender<Result<(), EngineInitError>>,
    },
    Stream {
        messages: Vec<ChatMessage>,
        events: mpsc::Sender<WorkerEvent>,
    },
    Once {
        messages: Vec<ChatMessage>,
        reply: oneshot::Sender<Result<Completion, EngineError>>,
    },
}

/// Messages streamed back from a worker for one streaming request.
enum WorkerEvent {
    Chunk(Result<StreamChunk, EngineError>),
    /// The inner stream ended normally.
    End,
}

/// Hosts engines from `inner` on dedicated worker tasks.
pub struct WorkerEngineFactory {
    inner: Arc<dyn EngineFactory>,
    config: WorkerConfig,
}

impl WorkerEngineFactory {
    pub fn new(inner: Arc<dyn EngineFactory>, config: WorkerConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl EngineFactory for WorkerEngineFactory {
    fn name(&self) -> &str {
        "worker"
    }

    async fn construct(
        &self,
        model_id: &str,
        mut options: EngineOptions<'_>,
    ) -> Result<Arc<dyn EngineHandle>, EngineInitError> {
        let (commands, command_rx) = mpsc::channel(self.config.command_capacity.max(1));
        tokio::spawn(run_worker(self.inner.clone(), command_rx));

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        commands
            .send(Command::Load {
                model_id: model_id.to_string(),
                generation: options.generation.clone(),
                cache_mode: options.cache_mode,
                progress: progress_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineInitError::Transport("worker exited before load".into()))?;

        // The worker drops its progress sender once loading finishes (or it dies).
        while let Some(event) = progress_rx.recv().await {
            options.report(&event);
        }

        reply_rx
            .await
            .map_err(|_| EngineInitError::Transport("worker dropped the load request".into()))??;

        info!(model = model_id, inner = self.inner.name(), "Worker engine ready");

        Ok(Arc::new(WorkerEngine {
            model_id: model_id.to_string(),
            commands,
            reply_capacity: self.config.reply_capacity.max(1),
        }))
    }
}

/// Handle to an engine living on a worker task.
pub struct WorkerEngine {
    model_id: String,
    commands: mpsc::Sender<Command>,
    reply_capacity: usize,
}

impl WorkerEngine {
    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Transport("worker is not running".into()))
    }
}

#[async_trait]
impl EngineHandle for WorkerEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, EngineError> {
        let (events, rx) = mpsc::channel(self.reply_capacity);
        self.send(Command::Stream {
            messages: messages.to_vec(),
            events,
        })
        .await?;

        // `None` state = stream finished; a channel closing before `End` is a transport failure.
        let stream = futures::stream::unfold(Some(rx), |state| async move {
            let mut rx = state?;
            match rx.recv().await {
                Some(WorkerEvent::Chunk(item)) => Some((item, Some(rx))),
                Some(WorkerEvent::End) => None,
                None => Some((
                    Err(EngineError::Transport("worker closed the stream early".into())),
                    None,
                )),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<Completion, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Once {
            messages: messages.to_vec(),
            reply,
        })
        .await?;

        reply_rx
            .await
            .map_err(|_| EngineError::Transport("worker dropped the request".into()))?
    }
}

/// Worker main loop: owns the inner engine and serves commands in order.
async fn run_worker(inner: Arc<dyn EngineFactory>, mut commands: mpsc::Receiver<Command>) {
    let mut engine: Option<Arc<dyn EngineHandle>> = None;

    while let Some(command) = commands.recv().await {
        match command {
            Command::Load {
                model_id,
                generation,
                cache_mode,
                progress,
                reply,
            } => {
                let mut forward = move |event: &ProgressEvent| {
                    let _ = progress.send(event.clone());
                };
                let options = EngineOptions::new(generation, cache_mode).with_progress(&mut forward);
                let result = inner.construct(&model_id, options).await;
                drop(forward);

                let result = result.map(|handle| {
                    engine = Some(handle);
                });
                let _ = reply.send(result);
            }
            Command::Stream { messages, events } => {
                let Some(handle) = engine.as_ref() else {
                    let _ = events
                        .send(WorkerEvent::Chunk(Err(EngineError::Transport(
                            "worker has no engine loaded".into(),
                        ))))
                        .await;
                    let _ = events.send(WorkerEvent::End).await;
                    continue;
                };

                match handle.complete_streaming(&messages).await {
                    Ok(mut stream) => {
                        let mut relayed = true;
                        while let Some(item) = stream.next().await {
                            if events.send(WorkerEvent::Chunk(item)).await.is_err() {
                                // Caller dropped the stream.
                                relayed = false;
                                break;
                            }
                        }
                        if relayed {
                            let _ = events.send(WorkerEvent::End).await;
                        }
                    }
                    Err(e) => {
                        let _ = events.send(WorkerEvent::Chunk(Err(e))).await;
                        let _ = events.send(WorkerEvent::End).await;
                    }
                }
            }
            Command::Once { messages, reply } => {
                let result = match engine.as_ref() {
                    Some(handle) => handle.complete_once(&messages).await,
                    None => Err(EngineError::Transport("worker has no engine loaded".into())),
                };
                if reply.send(result).is_err() {
                    warn!("Caller went away before the completion was delivered");
                }
            }
        }
    }

    debug!(
        model = ?engine.as_ref().map(|e| e.model_id().to_string()),
        "Worker exiting"
    );
}
