//! llm-engine-adapter: one chat-completion interface over interchangeable LLM engines.
//!
//! An [`adapter::EngineAdapter`] holds at most one live engine, built lazily
//! for the model a caller asks for and rebuilt when the model changes.
//! Engines come from an [`engine::EngineFactory`]:
//!   in-process ([`engine::local`]), worker-hosted ([`engine::worker`]),
//!   or a remote OpenAI-compatible provider ([`engine::remote`]).
//!
//! Streaming and one-shot completions are reported through the same
//! callbacks, so callers do not care which backend is configured.

pub mod adapter;
pub mod api;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;

pub use adapter::EngineAdapter;
pub use api::{ChatApi, ChatMessage, ChatOptions, ModelConfig};
pub use error::{AdapterError, EngineError, EngineInitError};
