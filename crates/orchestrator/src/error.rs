//! Orchestrator error type.

use thiserror::Error;

use conduit_bus::BusError;
use conduit_worker::WorkerError;

use crate::persistence::PersistenceError;

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by bootstrap, dispatch and shutdown.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] conduit_core::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Startup could not complete.
    #[error("bootstrap failed: {reason}")]
    Bootstrap { reason: String },
}

impl OrchestratorError {
    /// Create a bootstrap error.
    pub fn bootstrap(reason: impl Into<String>) -> Self {
        Self::Bootstrap {
            reason: reason.into(),
        }
    }

    /// Check if error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Bus(e) => e.is_retryable(),
            Self::Persistence(e) => e.is_retryable(),
            Self::Config(_) | Self::Worker(_) | Self::Bootstrap { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_follows_source() {
        let err: OrchestratorError = BusError::connection_failed("down").into();
        assert!(err.is_retryable());
        let err: OrchestratorError = PersistenceError::query_failed("bad").into();
        assert!(!err.is_retryable());
        assert!(!OrchestratorError::bootstrap("x").is_retryable());
    }
}
