//! Persistence error types for the knowledge store.

use std::fmt;

use thiserror::Error;

/// Errors that can occur during knowledge store operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Failed to connect to the database
    #[error("connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// Query execution failed
    #[error("query failed: {reason}")]
    QueryFailed { reason: String },

    /// Record not found
    #[error("record not found: {entity_type} with id '{id}'")]
    NotFound { entity_type: String, id: String },

    /// Serialization/deserialization error
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// Timeout waiting for operation
    #[error("operation timed out")]
    Timeout,

    /// Schema error
    #[error("schema error: {reason}")]
    SchemaError { reason: String },
}

impl PersistenceError {
    /// Create a connection failed error.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    /// Create a query failed error.
    pub fn query_failed(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization_error(reason: impl Into<String>) -> Self {
        Self::SerializationError {
            reason: reason.into(),
        }
    }

    /// Create a schema error.
    pub fn schema_error(reason: impl Into<String>) -> Self {
        Self::SchemaError {
            reason: reason.into(),
        }
    }

    /// Check if error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::Timeout)
    }
}

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Categorize a SurrealDB error by its message.
pub fn from_surrealdb_error(err: impl fmt::Display) -> PersistenceError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") {
        PersistenceError::Timeout
    } else if lower.contains("connect") {
        PersistenceError::connection_failed(msg)
    } else if lower.contains("not found") || lower.contains("does not exist") {
        PersistenceError::not_found("unknown", msg)
    } else if lower.contains("serializ") || lower.contains("deserializ") {
        PersistenceError::serialization_error(msg)
    } else {
        PersistenceError::query_failed(msg)
    }
}
