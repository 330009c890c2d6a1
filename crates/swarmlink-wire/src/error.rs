//! Errors from the wire layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;
