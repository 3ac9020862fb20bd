//! Remote engine over an OpenAI-compatible HTTP API.
//!
//! Implements the subset of the API the adapter needs:
//! - GET {base_url}/models (optional model check at construction)
//! - POST {base_url}/chat/completions, plain JSON or SSE streaming

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::api::ChatMessage;
use crate::config::RemoteConfig;
use crate::engine::{
    ChunkStream, Completion, EngineFactory, EngineHandle, EngineOptions, GenerationParams,
    ProgressEvent, StreamChunk,
};
use crate::error::{EngineError, EngineInitError};

// OpenAI wire types

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    id: String,
}

/// Chat completion response (non-streaming).
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Streaming chat completion chunk.
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,

    /// Providers report mid-stream failures as `{"error": {...}}`.
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Builds [`RemoteEngine`]s bound to one OpenAI-compatible endpoint.
pub struct RemoteEngineFactory {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    verify_model: bool,
}

impl RemoteEngineFactory {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            verify_model: true,
        }
    }

    /// Build from configuration; reads the API key from the environment.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::new(config.base_url.clone(), config.api_key())
            .with_client(client)
            .with_model_check(config.verify_model))
    }

    /// Sets a custom reqwest client.
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn with_model_check(mut self, verify: bool) -> Self {
        self.verify_model = verify;
        self
    }

    async fn check_model(&self, model_id: &str) -> Result<(), EngineInitError> {
        let url = format!("{}/models", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        match response.status().as_u16() {
            200..=299 => {}
            401 | 403 => return Err(EngineInitError::Auth),
            status => {
                return Err(EngineInitError::Transport(format!(
                    "model listing failed with status {status}"
                )))
            }
        }

        let models: ModelList = response.json().await?;
        if models.data.iter().any(|m| m.id == model_id) {
            Ok(())
        } else {
            Err(EngineInitError::UnsupportedModel(model_id.to_string()))
        }
    }
}

#[async_trait]
impl EngineFactory for RemoteEngineFactory {
    fn name(&self) -> &str {
        "remote"
    }

    async fn construct(
        &self,
        model_id: &str,
        mut options: EngineOptions<'_>,
    ) -> Result<Arc<dyn EngineHandle>, EngineInitError> {
        let start = Instant::now();

        if self.verify_model {
            options.report(&ProgressEvent::new(
                format!("Checking {model_id} at {}", self.base_url),
                0.0,
                0.0,
            ));
            self.check_model(model_id).await?;
        }

        let elapsed = start.elapsed().as_secs_f64();
        options.report(&ProgressEvent::new(
            format!("Connected to {}", self.base_url),
            1.0,
            elapsed,
        ));
        info!(model = model_id, base_url = self.base_url, elapsed_secs = elapsed, "Remote engine ready");

        Ok(Arc::new(RemoteEngine {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model_id: model_id.to_string(),
            params: options.generation,
        }))
    }
}

/// A model bound to a remote endpoint.
pub struct RemoteEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model_id: String,
    params: GenerationParams,
}

impl RemoteEngine {
    fn build_body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model_id,
            "messages": messages,
            "temperature": self.params.temperature,
            "top_p": self.params.top_p,
            "presence_penalty": self.params.presence_penalty,
            "frequency_penalty": self.params.frequency_penalty,
            "stream": stream,
        });
        if let Some(max) = self.params.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, EngineError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".into());
            Err(EngineError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl EngineHandle for RemoteEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, EngineError> {
        let response = self.post(&self.build_body(messages, true)).await?;
        let status = response.status().as_u16();
        debug!(model = self.model_id, status, "Streaming response started");

        let lines = SseParser::new(Box::pin(response.bytes_stream()));
        Ok(Box::pin(
            lines.map(move |line| line.and_then(|data| parse_chunk(&data, status))),
        ))
    }

    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<Completion, EngineError> {
        let response = self.post(&self.build_body(messages, false)).await?;
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::InvalidResponse("missing choices".into()))?;

        Ok(Completion {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
        })
    }
}

/// Decode one SSE payload. `status` is the HTTP status the stream was opened with.
fn parse_chunk(data: &str, status: u16) -> Result<StreamChunk, EngineError> {
    let chunk: ChatCompletionChunk =
        serde_json::from_str(data).map_err(|e| EngineError::InvalidResponse(e.to_string()))?;

    if let Some(error) = chunk.error {
        let message = match error.get("message").and_then(|m| m.as_str()) {
            Some(message) => message.to_string(),
            None => error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()),
        };
        return Err(EngineError::Api { status, message });
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .map(|c| StreamChunk {
            delta: c.delta.content,
            finish_reason: c.finish_reason,
        })
        .unwrap_or_default())
}

// SSE framing

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Splits a `text/event-stream` body into `data:` payloads, ending at `[DONE]`.
///
/// Bytes are buffered raw and only complete lines are decoded, so a
/// multibyte character split across reads is reassembled first.
struct SseParser {
    inner: ByteStream,
    buffer: BytesMut,
    done: bool,
}

impl SseParser {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            done: false,
        }
    }

    fn next_line(&mut self) -> Option<BytesMut> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        Some(line)
    }

    /// The payload of a `data:` line; `None` for comments, blanks and other fields.
    fn parse_data(line: &str) -> Option<&str> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            return None;
        }
        trimmed.strip_prefix("data:").map(str::trim_start)
    }

    /// Handle one raw line; `Some` when it yields an item or ends the stream.
    fn on_line(&mut self, line: &[u8]) -> Option<Option<Result<String, EngineError>>> {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(e) => {
                self.done = true;
                return Some(Some(Err(EngineError::InvalidResponse(e.to_string()))));
            }
        };
        let data = Self::parse_data(line)?;
        if data == "[DONE]" {
            self.done = true;
            return Some(None);
        }
        Some(Some(Ok(data.to_string())))
    }
}

impl Stream for SseParser {
    type Item = Result<String, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }

            if let Some(line) = self.next_line() {
                if let Some(item) = self.on_line(&line) {
                    return Poll::Ready(item);
                }
                continue;
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => self.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(EngineError::from(e))));
                }
                Poll::Ready(None) => {
                    // Flush a trailing line without newline.
                    let rest = self.buffer.split();
                    self.done = true;
                    if let Some(item) = self.on_line(&rest) {
                        return Poll::Ready(item);
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
