//! Failure routing: announce the failed stage and keep an audit record.
//!
//! Failures are never retried here. Redelivery, if any, is the bus's
//! business.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use tracing::{error, warn};

use conduit_bus::{MessageBus, STAGE_FAILED_SUBJECT};
use conduit_core::{AuditKind, AuditRecord, StageEvent, StageFailedEvent};
use conduit_worker::WorkerOutput;

use crate::persistence::KnowledgeStore;

/// Why a stage failed.
#[derive(Debug, Clone)]
pub enum FailureCause {
    /// The worker exited nonzero or was killed by a signal.
    WorkerExit(WorkerOutput),
    /// The worker could not be started.
    SpawnFailed { reason: String },
    /// The worker succeeded but its deliverable could not be published.
    PublishFailed { reason: String, output: WorkerOutput },
}

impl FailureCause {
    /// Short description carried in the `stage.failed` event.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::WorkerExit(output) => output.failure_reason(),
            Self::SpawnFailed { reason } => format!("worker could not be spawned: {reason}"),
            Self::PublishFailed { reason, .. } => format!("deliverable publish failed: {reason}"),
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::WorkerExit(_) => "worker_exit",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::PublishFailed { .. } => "publish_failed",
        }
    }

    const fn output(&self) -> Option<&WorkerOutput> {
        match self {
            Self::WorkerExit(output) | Self::PublishFailed { output, .. } => Some(output),
            Self::SpawnFailed { .. } => None,
        }
    }
}

/// What the router managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRouted {
    pub event_published: bool,
    pub recorded: bool,
}

/// Keep at most `max_bytes` of the tail of stderr followed by stdout,
/// cutting on a UTF-8 boundary.
#[must_use]
pub fn truncate_for_audit(stderr: &str, stdout: &str, max_bytes: usize) -> String {
    let combined = match (stderr.is_empty(), stdout.is_empty()) {
        (false, false) => format!("{stderr}\n--- stdout ---\n{stdout}"),
        (false, true) => stderr.to_string(),
        (true, _) => stdout.to_string(),
    };
    if combined.len() <= max_bytes {
        return combined;
    }

    let mut start = combined.len().saturating_sub(max_bytes);
    while !combined.is_char_boundary(start) {
        start = start.saturating_add(1);
    }
    combined.get(start..).unwrap_or_default().to_string()
}

/// Publishes `stage.failed` events and writes failure records.
#[derive(Clone)]
pub struct FailureRouter {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn KnowledgeStore>,
    max_raw_output_bytes: usize,
}

impl FailureRouter {
    pub fn new(bus: Arc<dyn MessageBus>, store: Arc<dyn KnowledgeStore>, max_raw_output_bytes: usize) -> Self {
        Self {
            bus,
            store,
            max_raw_output_bytes,
        }
    }

    /// Route one failure. Each step is attempted even if the other fails.
    pub async fn route(&self, event: &StageEvent, cause: &FailureCause) -> FailureRouted {
        let reason = cause.describe();
        warn!(
            request_id = %event.request_id,
            agent_id = %event.agent_id,
            stage = %event.stage_name,
            cause = cause.kind(),
            reason = %reason,
            "Stage failed"
        );

        let event_published = self.publish_failed_event(event, &reason).await;

        let record = self.failure_record(event, cause, &reason);
        let recorded = match self.store.append_audit(&record).await {
            Ok(()) => true,
            Err(e) => {
                error!(request_id = %event.request_id, error = %e, "Failed to persist failure record");
                false
            }
        };

        FailureRouted {
            event_published,
            recorded,
        }
    }

    async fn publish_failed_event(&self, event: &StageEvent, reason: &str) -> bool {
        let payload = match StageFailedEvent::for_stage(event, reason).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to encode stage.failed event");
                return false;
            }
        };
        match self.bus.publish(STAGE_FAILED_SUBJECT, Bytes::from(payload)).await {
            Ok(_) => true,
            Err(e) => {
                error!(request_id = %event.request_id, error = %e, "Failed to publish stage.failed event");
                false
            }
        }
    }

    fn failure_record(&self, event: &StageEvent, cause: &FailureCause, reason: &str) -> AuditRecord {
        let output = cause.output();
        let raw = output.map_or_else(String::new, |o| {
            truncate_for_audit(&o.stderr, &o.stdout, self.max_raw_output_bytes)
        });
        AuditRecord {
            kind: AuditKind::Failure,
            agent_id: event.agent_id.clone(),
            request_id: event.request_id.clone(),
            stage_name: event.stage_name.clone(),
            status: "failed".to_string(),
            summary: reason.to_string(),
            change_details: json!({
                "cause": cause.kind(),
                "exit_code": output.and_then(|o| o.exit_code),
                "duration_ms": output.map(|o| u64::try_from(o.duration.as_millis()).unwrap_or(u64::MAX)),
                "stderr_bytes": output.map(|o| o.stderr.len()),
                "stdout_bytes": output.map(|o| o.stdout.len()),
            }),
            truncated_raw_output: raw,
            recorded_at: Utc::now(),
        }
    }
}
