//! Shared error types for SwarmLink.

use thiserror::Error;

/// Top-level error type shared by all SwarmLink crates.
#[derive(Error, Debug)]
pub enum SwarmError {
    /// A payload or envelope could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An endpoint address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with SwarmError.
pub type SwarmResult<T> = Result<T, SwarmError>;
