//! Error types for engine construction, completion, and the adapter itself.
//!
//! Initialization and transport failures are returned as `Err` from
//! [`crate::adapter::EngineAdapter::chat`]. An empty reply is not an `Err`:
//! it is reported through the caller's `on_error` callback.

use thiserror::Error;

/// Engine construction failed.
#[derive(Error, Debug)]
pub enum EngineInitError {
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Worker transport failed: {0}")]
    Transport(String),

    #[error("Authentication failed")]
    Auth,

    #[error("Weight cache I/O failed: {0}")]
    Cache(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A completion request failed after the engine was constructed.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Worker transport failed: {0}")]
    Transport(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors surfaced by the adapter.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Engine initialization failed: {0}")]
    EngineInit(#[from] EngineInitError),

    #[error("Engine failed: {0}")]
    Engine(#[from] EngineError),

    #[error("Empty response generated by LLM")]
    EmptyResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_response_message() {
        let err = AdapterError::EmptyResponse;
        assert_eq!(err.to_string(), "Empty response generated by LLM");
    }

    #[test]
    fn test_init_error_wraps() {
        let err: AdapterError = EngineInitError::UnsupportedModel("nope".into()).into();
        assert_eq!(
            err.to_string(),
            "Engine initialization failed: Unsupported model: nope"
        );
        assert!(!matches!(err, AdapterError::EmptyResponse));
    }

    #[test]
    fn test_api_error_display() {
        let err = EngineError::Api {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "API error (500): boom");
    }
}
