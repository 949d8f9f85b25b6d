//! Error types for bus operations.

use thiserror::Error;

/// Result type alias for bus operations.
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Errors raised while talking to the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Could not reach the bus.
    #[error("connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// Stream creation or verification failed.
    #[error("provisioning stream '{stream}' failed: {reason}")]
    StreamProvisioning { stream: String, reason: String },

    /// A stream with that name already exists.
    #[error("stream '{stream}' already exists")]
    StreamExists { stream: String },

    /// The named stream does not exist.
    #[error("stream '{stream}' not found")]
    StreamNotFound { stream: String },

    /// No stream captures the subject being published to.
    #[error("no stream captures subject '{subject}'")]
    NoStreamForSubject { subject: String },

    /// Publish was rejected or never acknowledged.
    #[error("publish to '{subject}' failed: {reason}")]
    PublishFailed { subject: String, reason: String },

    /// Payload exceeds the per-message ceiling.
    #[error("payload of {size} bytes exceeds the {limit}-byte message ceiling")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A subject token contains reserved characters.
    #[error("invalid subject token '{token}': {reason}")]
    InvalidSubjectToken { token: String, reason: String },

    /// Reading a message back failed.
    #[error("fetch from '{subject}' failed: {reason}")]
    FetchFailed { subject: String, reason: String },

    /// Consumer creation or message pull failed.
    #[error("subscription failed: {reason}")]
    SubscriptionFailed { reason: String },

    /// Ack or nak could not be delivered.
    #[error("acknowledgment failed: {reason}")]
    AckFailed { reason: String },

    /// The bus connection has been released.
    #[error("bus is closed")]
    Closed,

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Create a connection failed error.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    /// Create a stream provisioning error.
    pub fn stream_provisioning(stream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StreamProvisioning {
            stream: stream.into(),
            reason: reason.into(),
        }
    }

    /// Create a stream not found error.
    pub fn stream_not_found(stream: impl Into<String>) -> Self {
        Self::StreamNotFound {
            stream: stream.into(),
        }
    }

    /// Create a publish failed error.
    pub fn publish_failed(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PublishFailed {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid subject token error.
    pub fn invalid_subject_token(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSubjectToken {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Create a fetch failed error.
    pub fn fetch_failed(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FetchFailed {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Create a subscription failed error.
    pub fn subscription_failed(reason: impl Into<String>) -> Self {
        Self::SubscriptionFailed {
            reason: reason.into(),
        }
    }

    /// Create an ack failed error.
    pub fn ack_failed(reason: impl Into<String>) -> Self {
        Self::AckFailed {
            reason: reason.into(),
        }
    }

    /// Check if this error is a transient transport failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::PublishFailed { .. }
                | Self::FetchFailed { .. }
                | Self::AckFailed { .. }
        )
    }
}
