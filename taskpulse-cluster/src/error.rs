//! Error types for the realtime layer

use thiserror::Error;

/// Realtime error types
#[derive(Debug, Error)]
pub enum Error {
    /// The pub/sub backend is unreachable or timed out
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Access lookup failed: {0}")]
    AccessLookup(#[source] taskpulse_core::Error),

    #[error("Persist failed: {0}")]
    Persist(#[source] taskpulse_core::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for realtime operations
pub type Result<T> = std::result::Result<T, Error>;
