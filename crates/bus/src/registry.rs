//! Idempotent stream provisioning.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

pub use conduit_core::agent_stream_name;
use conduit_core::{DiscardPolicy, RetentionSettings, StreamDescriptor};

use crate::backend::MessageBus;
use crate::error::{BusError, BusResult};
use crate::subject::{validate_token, DELIVERABLES_PREFIX, ORCHESTRATION_NAMESPACE};

/// Stream holding control-plane events.
pub const ORCHESTRATION_STREAM: &str = "ORCHESTRATION_EVENTS";

/// A party that owns one stream and its subject namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    stream_name: String,
    subject_pattern: String,
}

impl StreamIdentity {
    /// The deliverables stream of a worker identity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSubjectToken` if `agent_id` cannot be a subject token.
    pub fn agent(agent_id: &str) -> BusResult<Self> {
        let agent_id = validate_token(agent_id)?;
        Ok(Self {
            stream_name: agent_stream_name(agent_id),
            subject_pattern: format!("{DELIVERABLES_PREFIX}.{agent_id}.>"),
        })
    }

    /// The orchestration events stream.
    #[must_use]
    pub fn orchestration() -> Self {
        Self {
            stream_name: ORCHESTRATION_STREAM.to_string(),
            subject_pattern: format!("{ORCHESTRATION_NAMESPACE}.>"),
        }
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    #[must_use]
    pub fn subject_pattern(&self) -> &str {
        &self.subject_pattern
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.stream_name, self.subject_pattern)
    }
}

/// Identities for every agent plus the orchestration stream.
///
/// # Errors
///
/// Returns `InvalidSubjectToken` for the first unusable agent id.
pub fn identities_for<'a>(agent_ids: impl IntoIterator<Item = &'a str>) -> BusResult<Vec<StreamIdentity>> {
    let mut identities = agent_ids
        .into_iter()
        .map(StreamIdentity::agent)
        .collect::<BusResult<Vec<_>>>()?;
    identities.push(StreamIdentity::orchestration());
    Ok(identities)
}

/// Result of provisioning one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProvision {
    Created,
    Existing,
}

/// Creates streams on demand and treats "already there" as success.
#[derive(Clone)]
pub struct StreamRegistry {
    bus: Arc<dyn MessageBus>,
    retention: RetentionSettings,
}

impl StreamRegistry {
    pub fn new(bus: Arc<dyn MessageBus>, retention: RetentionSettings) -> Self {
        Self { bus, retention }
    }

    /// Descriptor this registry would create for `identity`.
    #[must_use]
    pub fn descriptor(&self, identity: &StreamIdentity) -> StreamDescriptor {
        StreamDescriptor {
            name: identity.stream_name.clone(),
            subject_pattern: identity.subject_pattern.clone(),
            max_messages: self.retention.max_messages,
            max_bytes: self.retention.max_bytes,
            max_age: self.retention.max_age,
            max_message_size: self.retention.max_message_size,
            discard_policy: DiscardPolicy::Old,
        }
    }

    /// Make sure the stream for `identity` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus cannot be queried or refuses to create
    /// the stream. Losing a creation race is not an error.
    pub async fn ensure_stream(&self, identity: &StreamIdentity) -> BusResult<StreamProvision> {
        if let Some(existing) = self.bus.stream_info(&identity.stream_name).await? {
            if existing.subject_pattern != identity.subject_pattern {
                warn!(
                    stream = %identity.stream_name,
                    expected = %identity.subject_pattern,
                    actual = %existing.subject_pattern,
                    "Existing stream captures a different subject namespace"
                );
            }
            info!(stream = %identity.stream_name, created = false, "Stream verified");
            return Ok(StreamProvision::Existing);
        }

        let provision = match self.bus.create_stream(&self.descriptor(identity)).await {
            Ok(()) => StreamProvision::Created,
            Err(BusError::StreamExists { .. }) => StreamProvision::Existing,
            Err(e) => return Err(e),
        };
        info!(
            stream = %identity.stream_name,
            created = provision == StreamProvision::Created,
            "Stream provisioned"
        );
        Ok(provision)
    }

    /// Provision every identity, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first provisioning error.
    pub async fn ensure_all(
        &self,
        identities: &[StreamIdentity],
    ) -> BusResult<Vec<(StreamIdentity, StreamProvision)>> {
        let mut provisioned = Vec::with_capacity(identities.len());
        for identity in identities {
            let provision = self.ensure_stream(identity).await?;
            provisioned.push((identity.clone(), provision));
        }
        Ok(provisioned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_stream_name() {
        assert_eq!(agent_stream_name("cynthia"), "DELIVERABLES_CYNTHIA");
        assert_eq!(agent_stream_name("qa-bot_2"), "DELIVERABLES_QA_BOT_2");
    }

    #[test]
    fn test_agent_identity() {
        let identity = StreamIdentity::agent("roy").ok();
        assert_eq!(
            identity.as_ref().map(StreamIdentity::subject_pattern),
            Some("deliverables.roy.>")
        );
        assert!(StreamIdentity::agent("r.oy").is_err());
    }

    #[test]
    fn test_identities_for_appends_orchestration() {
        let identities = identities_for(["cynthia", "roy"]).ok().unwrap_or_default();
        assert_eq!(identities.len(), 3);
        assert_eq!(identities[2], StreamIdentity::orchestration());
        assert_eq!(identities[2].subject_pattern(), "orchestration.events.>");
    }
}
