//! Error types for the runner module.

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while executing commands.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to start {program}: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("Command '{command}' printed invalid outputs: {message}")]
    InvalidOutput { command: String, message: String },

    #[error("Command '{0}' runs inside the container but no vm_id is known")]
    MissingVmId(String),

    #[error("Restart info belongs to {found}, not {expected}")]
    CheckpointMismatch { expected: String, found: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
