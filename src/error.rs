//! Error types for command sessions

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("Command '{0}' not found")]
    SessionNotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Whether this error is a caller mistake (bad id, bad argument) as
    /// opposed to an internal fault. Caller errors are returned to the
    /// caller as structured `{error}` results; faults propagate.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ExecError::SessionNotFound(_) | ExecError::InvalidParam(_)
        )
    }
}
