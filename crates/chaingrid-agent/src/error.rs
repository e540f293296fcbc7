//! Error types for agents and the agent registry.

use chaingrid_bus::BusError;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while talking to or running an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("execution was cancelled")]
    Cancelled,

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("agent rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected reply from agent: {0}")]
    Protocol(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}
