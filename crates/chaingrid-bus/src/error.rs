//! Error types for the event bus.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors that can occur when sending over the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("no handler registered at {0}")]
    NoHandler(String),

    #[error("request to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("handler at {0} went away without replying")]
    Closed(String),

    #[error("request failed: {0}")]
    Failed(String),

    #[error("invalid message: {0}")]
    Codec(#[from] serde_json::Error),
}
