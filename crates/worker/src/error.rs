//! Error types for worker operations.

use thiserror::Error;

/// Result type for worker operations.
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Errors raised while launching or supervising a worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The process could not be started (missing binary, permission denied).
    #[error("failed to spawn '{executable}': {reason}")]
    SpawnFailed { executable: String, reason: String },

    /// A standard stream was not captured.
    #[error("worker {stream} pipe unavailable")]
    PipeUnavailable { stream: &'static str },

    /// Waiting for the process failed.
    #[error("waiting for worker failed: {reason}")]
    WaitFailed { reason: String },

    /// I/O error while reading worker output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Create a spawn failed error.
    pub fn spawn_failed(executable: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            executable: executable.into(),
            reason: reason.into(),
        }
    }

    /// Create a wait failed error.
    pub fn wait_failed(reason: impl Into<String>) -> Self {
        Self::WaitFailed {
            reason: reason.into(),
        }
    }
}
