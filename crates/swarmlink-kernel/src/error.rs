//! Kernel-specific error types.

use swarmlink_types::error::SwarmError;
use swarmlink_wire::WireError;
use thiserror::Error;

/// Kernel error type wrapping the lower layers' errors.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped SwarmError.
    #[error(transparent)]
    Swarm(#[from] SwarmError),

    /// A wrapped transport error.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The coordinator has not been started, or was shut down.
    #[error("Coordinator is not running")]
    NotRunning,

    /// The configuration could not be used.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;

/// Why a response handler was invoked without a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("no response within {0:?}")]
    TimedOut(std::time::Duration),

    #[error("coordinator shut down")]
    Shutdown,

    #[error("malformed acknowledgement: {0}")]
    Malformed(String),
}
