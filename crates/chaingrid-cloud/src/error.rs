//! Cloud manager error types.

use thiserror::Error;

/// Result type alias for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors that can occur while selecting, creating or destroying VMs.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("invalid cloud configuration: {0}")]
    Config(String),

    #[error("cloud provider error: {0}")]
    Provider(String),

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("state store error: {0}")]
    State(#[from] chaingrid_state::StateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
