//! Error types for the state container.

use thiserror::Error;

/// Main error type for container operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Partial is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error for {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Snapshot incomplete: missing {0:?}")]
    Incomplete(Vec<String>),

    #[error("No tokio runtime available to drive producers")]
    NoRuntime,

    #[error("Producer failed: {0}")]
    Producer(String),
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Encode(e.to_string())
    }
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, StateError>;
