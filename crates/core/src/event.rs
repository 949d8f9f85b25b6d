//! Control-plane events exchanged on `orchestration.events.*`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::result::Result;

/// Event type announcing that a stage needs an agent.
pub const STAGE_STARTED: &str = "stage.started";

/// Event type announcing that a stage could not be completed.
pub const STAGE_FAILED: &str = "stage.failed";

/// "Stage N of request R needs agent A".
///
/// Produced by the upstream control plane and consumed exactly once per
/// durable subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    /// Event discriminator, e.g. `stage.started`.
    pub event_type: String,
    /// Workflow request identifier (`REQ-...`).
    #[serde(rename = "reqNumber", alias = "requestId")]
    pub request_id: String,
    /// Human-readable stage name (`Research`, `Backend`, ...).
    #[serde(rename = "stage", alias = "stageName")]
    pub stage_name: String,
    /// Worker identity that should handle the stage.
    pub agent_id: String,
    /// Opaque payload handed through to the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<Value>,
}

impl StageEvent {
    /// Create a `stage.started` event.
    pub fn started(
        request_id: impl Into<String>,
        stage_name: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: STAGE_STARTED.to_string(),
            request_id: request_id.into(),
            stage_name: stage_name.into(),
            agent_id: agent_id.into(),
            context_data: None,
        }
    }

    /// Attach context data.
    #[must_use]
    pub fn with_context_data(mut self, data: Value) -> Self {
        self.context_data = Some(data);
        self
    }

    /// Decode and validate an event from a bus payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not JSON, misses required fields,
    /// or carries empty identifiers.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let event: Self = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }

    /// Encode the event as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Whether this event asks for a worker to be dispatched.
    #[must_use]
    pub fn is_stage_started(&self) -> bool {
        self.event_type == STAGE_STARTED
    }

    fn validate(&self) -> Result<()> {
        [
            ("eventType", &self.event_type),
            ("reqNumber", &self.request_id),
            ("stage", &self.stage_name),
            ("agentId", &self.agent_id),
        ]
        .iter()
        .find(|(_, value)| value.trim().is_empty())
        .map_or(Ok(()), |(field, _)| {
            Err(Error::invalid_record(format!("stage event field '{field}' is empty")))
        })
    }
}

/// Published on `orchestration.events.stage.failed` when a stage cannot complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailedEvent {
    pub event_type: String,
    #[serde(rename = "reqNumber", alias = "requestId")]
    pub request_id: String,
    #[serde(rename = "stage", alias = "stageName")]
    pub stage_name: String,
    pub agent_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl StageFailedEvent {
    /// Build the failure event for a stage.
    pub fn for_stage(event: &StageEvent, error: impl Into<String>) -> Self {
        Self {
            event_type: STAGE_FAILED.to_string(),
            request_id: event.request_id.clone(),
            stage_name: event.stage_name.clone(),
            agent_id: event.agent_id.clone(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Encode the event as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_decode_wire_shape() {
        let raw = br#"{"eventType":"stage.started","reqNumber":"REQ-1","stage":"Research","agentId":"cynthia","contextData":{"feature":"lots"}}"#;
        let event = StageEvent::decode(raw).unwrap();
        assert_eq!(event.request_id, "REQ-1");
        assert_eq!(event.stage_name, "Research");
        assert_eq!(event.agent_id, "cynthia");
        assert!(event.is_stage_started());
        assert_eq!(
            event.context_data.as_ref().and_then(|v| v.get("feature")),
            Some(&Value::from("lots"))
        );
    }

    #[test]
    fn test_decode_accepts_aliases() {
        let raw = br#"{"eventType":"stage.started","requestId":"REQ-2","stageName":"QA","agentId":"billy"}"#;
        let event = StageEvent::decode(raw).unwrap();
        assert_eq!(event.request_id, "REQ-2");
        assert_eq!(event.stage_name, "QA");
        assert!(event.context_data.is_none());
    }

    #[test]
    fn test_decode_rejects_garbage_and_empty_fields() {
        assert!(StageEvent::decode(b"not json").is_err());
        assert!(StageEvent::decode(br#"{"eventType":"stage.started"}"#).is_err());
        let empty_agent = br#"{"eventType":"stage.started","reqNumber":"REQ-1","stage":"Research","agentId":"  "}"#;
        assert!(matches!(
            StageEvent::decode(empty_agent),
            Err(Error::InvalidRecord { .. })
        ));
    }

    #[test]
    fn test_round_trip_through_bytes() {
        let event = StageEvent::started("REQ-3", "Backend", "roy")
            .with_context_data(serde_json::json!({"tables": 3}));
        let decoded = StageEvent::decode(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_failed_event_wire_shape() {
        let event = StageEvent::started("REQ-1", "Research", "cynthia");
        let failed = StageFailedEvent::for_stage(&event, "exit code 1");
        let json: Value = serde_json::from_slice(&failed.to_bytes().unwrap()).unwrap();
        assert_eq!(json["eventType"], "stage.failed");
        assert_eq!(json["reqNumber"], "REQ-1");
        assert_eq!(json["agentId"], "cynthia");
        assert_eq!(json["error"], "exit code 1");
        assert!(json.get("timestamp").is_some());
    }
}
