//! Error types for the rconsole core library.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for rconsole operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (unreadable file, invalid value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tracing subscriber could not be installed
    #[error("Tracing initialization error: {0}")]
    Tracing(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
