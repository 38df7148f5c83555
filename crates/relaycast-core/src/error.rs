//! Error types for `RelayCast` core library.

use thiserror::Error;

/// Result type alias using `RelayCast` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `RelayCast` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Destination registry could not be loaded or written
    #[error("Destination registry error: {0}")]
    Registry(String),

    /// Credential store could not be loaded or written
    #[error("Credential store error: {0}")]
    Credentials(String),

    /// Classifier pattern failed to compile
    #[error("Invalid classifier pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
