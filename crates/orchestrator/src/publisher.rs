//! Deliverable publication and cache bookkeeping for successful workers.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use conduit_bus::{deliverable_subject, task_type_for_stage, BusResult, DeliverableExchange};
use conduit_core::{
    AuditKind, AuditRecord, CompletionNotice, DeliverableCacheRow, DeliverableLocator,
    DeliverableMetadata, GenericResultExt, StageEvent,
};
use conduit_worker::{parse_completion_notice, NoticeParse, WorkerOutput};

use crate::failure::truncate_for_audit;
use crate::persistence::KnowledgeStore;

/// Result of handling a successful worker exit.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// The notice parsed and the deliverable is on the bus.
    Published {
        locator: DeliverableLocator,
        notice: CompletionNotice,
    },
    /// No notice could be read; a change record was written instead.
    Unparsed,
}

/// Turns successful worker output into a published deliverable.
#[derive(Clone)]
pub struct DeliverablePublisher {
    exchange: DeliverableExchange,
    store: Arc<dyn KnowledgeStore>,
    max_raw_output_bytes: usize,
}

impl DeliverablePublisher {
    pub fn new(exchange: DeliverableExchange, store: Arc<dyn KnowledgeStore>, max_raw_output_bytes: usize) -> Self {
        Self {
            exchange,
            store,
            max_raw_output_bytes,
        }
    }

    /// Parse the notice, publish, and cache.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the deliverable could not be published.
    /// Cache and audit failures are logged only.
    pub async fn publish(
        &self,
        event: &StageEvent,
        stage_ordinal: u32,
        output: &WorkerOutput,
    ) -> BusResult<PublishOutcome> {
        let notice = match parse_completion_notice(&output.stdout) {
            NoticeParse::Parsed(notice) => notice,
            NoticeParse::Unparsed => {
                warn!(
                    request_id = %event.request_id,
                    agent_id = %event.agent_id,
                    stage = %event.stage_name,
                    "Worker output carried no completion notice"
                );
                self.record_unparsed(event, output).await;
                return Ok(PublishOutcome::Unparsed);
            }
        };

        let task_type = task_type_for_stage(&event.stage_name);
        let subject = deliverable_subject(&event.agent_id, &task_type, &event.request_id)?;
        let locator = self
            .exchange
            .publish(
                &event.agent_id,
                &task_type,
                &event.request_id,
                deliverable_payload(&notice, output, self.max_raw_output_bytes),
                metadata_for(event, &task_type, &notice),
            )
            .await?;

        info!(
            request_id = %event.request_id,
            agent_id = %event.agent_id,
            subject = %subject,
            locator = %locator,
            status = %notice.status,
            "Deliverable published"
        );

        let row = DeliverableCacheRow {
            request_id: event.request_id.clone(),
            agent_id: event.agent_id.clone(),
            stage_ordinal,
            stage_name: event.stage_name.clone(),
            status: notice.status,
            summary: notice.summary.clone(),
            subject,
            locator: locator.to_string(),
            notice: serde_json::to_value(&notice).unwrap_or(Value::Null),
            completed_at: Utc::now(),
        };
        if let Err(e) = self.store.upsert_deliverable(&row).await {
            warn!(key = %row.cache_key(), error = %e, "Failed to cache deliverable");
        }

        Ok(PublishOutcome::Published { locator, notice })
    }

    async fn record_unparsed(&self, event: &StageEvent, output: &WorkerOutput) {
        let record = AuditRecord {
            kind: AuditKind::Change,
            agent_id: event.agent_id.clone(),
            request_id: event.request_id.clone(),
            stage_name: event.stage_name.clone(),
            status: "unparsed".to_string(),
            summary: "worker exited cleanly without a completion notice".to_string(),
            change_details: json!({
                "exit_code": output.exit_code,
                "stdout_bytes": output.stdout.len(),
                "stderr_bytes": output.stderr.len(),
            }),
            truncated_raw_output: truncate_for_audit(&output.stderr, &output.stdout, self.max_raw_output_bytes),
            recorded_at: Utc::now(),
        };
        let _ = self
            .store
            .append_audit(&record)
            .await
            .warn_and_discard("persist change record");
    }
}

/// The notice plus the tail of stdout, bounded so a chatty worker cannot
/// push the deliverable past the stream's message size limit.
fn deliverable_payload(notice: &CompletionNotice, output: &WorkerOutput, max_excerpt_bytes: usize) -> Value {
    json!({
        "notice": notice,
        "output_excerpt": truncate_for_audit("", &output.stdout, max_excerpt_bytes),
        "output_bytes": output.stdout.len(),
    })
}

fn metadata_for(event: &StageEvent, task_type: &str, notice: &CompletionNotice) -> DeliverableMetadata {
    let feature = event
        .context_data
        .as_ref()
        .and_then(|data| data.get("feature"))
        .and_then(Value::as_str);

    let metadata = DeliverableMetadata::new(&event.agent_id, task_type)
        .with_extra("stage", event.stage_name.clone())
        .with_extra("status", notice.status.to_string());
    let metadata = match &notice.complexity {
        Some(complexity) => metadata.with_extra("complexity", complexity.clone()),
        None => metadata,
    };
    match feature {
        Some(feature) => metadata.with_feature(feature),
        None => metadata,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use conduit_bus::{InMemoryBus, MessageBus, StreamIdentity, StreamRegistry};
    use conduit_core::{NoticeStatus, RetentionSettings};

    use super::*;
    use crate::persistence::InMemoryKnowledgeStore;

    fn output(stdout: &str) -> WorkerOutput {
        WorkerOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
        }
    }

    async fn publisher() -> (DeliverableExchange, Arc<InMemoryKnowledgeStore>, DeliverablePublisher) {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        StreamRegistry::new(bus.clone(), RetentionSettings::default())
            .ensure_stream(&StreamIdentity::agent("cynthia").unwrap())
            .await
            .unwrap();
        let exchange = DeliverableExchange::new(bus, 1 << 20);
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let publisher = DeliverablePublisher::new(exchange.clone(), store.clone(), 1024);
        (exchange, store, publisher)
    }

    #[tokio::test]
    async fn test_parsed_notice_is_published_and_cached() {
        let (exchange, store, publisher) = publisher().await;
        let event = StageEvent::started("REQ-1", "Research", "cynthia")
            .with_context_data(json!({"feature": "csv-export"}));
        let stdout = "work...\n```json\n{\"status\":\"complete\",\"agent\":\"cynthia\",\"summary\":\"done\"}\n```\n";

        let outcome = publisher.publish(&event, 1, &output(stdout)).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));

        let latest = exchange.fetch_latest("cynthia", "research", "REQ-1").await.unwrap().unwrap();
        assert_eq!(latest.metadata.feature.as_deref(), Some("csv-export"));
        assert_eq!(latest.payload["notice"]["summary"], "done");

        let rows = store.deliverables_for_request("REQ-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cache_key(), "REQ-1:cynthia:1");
        assert_eq!(rows[0].status, NoticeStatus::Complete);
        assert_eq!(rows[0].subject, "deliverables.cynthia.research.REQ-1");
    }

    #[tokio::test]
    async fn test_large_output_publishes_bounded_excerpt() {
        let (exchange, _store, publisher) = publisher().await;
        let event = StageEvent::started("REQ-5", "Research", "cynthia");
        let mut stdout = "x".repeat(2 << 20);
        stdout.push_str("\n{\"status\":\"complete\",\"agent\":\"cynthia\",\"summary\":\"big\"}\n");

        let outcome = publisher.publish(&event, 1, &output(&stdout)).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));

        let latest = exchange.fetch_latest("cynthia", "research", "REQ-5").await.unwrap().unwrap();
        assert_eq!(latest.payload["notice"]["summary"], "big");
        assert_eq!(latest.payload["output_bytes"], stdout.len());
        let excerpt = latest.payload["output_excerpt"].as_str().unwrap();
        assert_eq!(excerpt.len(), 1024);
        assert!(excerpt.ends_with("\"big\"}\n"));
    }

    #[tokio::test]
    async fn test_unparsed_output_becomes_change_record() {
        let (exchange, store, publisher) = publisher().await;
        let event = StageEvent::started("REQ-2", "Research", "cynthia");

        let outcome = publisher.publish(&event, 1, &output("no notice at all")).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Unparsed);
        assert!(exchange.fetch_latest("cynthia", "research", "REQ-2").await.unwrap().is_none());
        let records = store.audit_records("REQ-2").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, AuditKind::Change);
        assert_eq!(records[0].truncated_raw_output, "no notice at all");
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_change_outcome() {
        let (_exchange, store, publisher) = publisher().await;
        store.set_fail_writes(true);
        let event = StageEvent::started("REQ-3", "Research", "cynthia");
        let stdout = r#"{"status":"complete","agent":"cynthia"}"#;

        let outcome = publisher.publish(&event, 1, &output(stdout)).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn test_missing_stream_is_publish_error() {
        let (_exchange, _store, publisher) = publisher().await;
        let event = StageEvent::started("REQ-4", "Backend", "roy");
        let stdout = r#"{"status":"complete","agent":"roy"}"#;

        assert!(publisher.publish(&event, 3, &output(stdout)).await.is_err());
    }
}
