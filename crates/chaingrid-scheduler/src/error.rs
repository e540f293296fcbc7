//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while scheduling process chains.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    State(#[from] chaingrid_state::StateError),

    #[error("event bus error: {0}")]
    Bus(#[from] chaingrid_bus::BusError),

    #[error("agent error: {0}")]
    Agent(#[from] chaingrid_agent::AgentError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
