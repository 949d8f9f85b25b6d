//! One stage event from worker launch to terminal outcome.

use std::sync::Arc;

use tracing::{info, warn};

use conduit_bus::task_type_for_stage;
use conduit_core::{DeliverableLocator, StageCatalog, StageEvent};
use conduit_worker::{WorkerOutcome, WorkerRunner};

use crate::failure::{FailureCause, FailureRouter};
use crate::harvester::LearningHarvester;
use crate::knowledge::{ContextComposer, KnowledgeRetriever};
use crate::persistence::KnowledgeStore;
use crate::publisher::{DeliverablePublisher, PublishOutcome};

/// Terminal outcome of processing one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResolution {
    Published { locator: DeliverableLocator },
    Unparsed,
    Failed { reason: String },
}

/// Runs the worker for a stage event and routes its result.
#[derive(Clone)]
pub struct StageProcessor {
    runner: Arc<dyn WorkerRunner>,
    store: Arc<dyn KnowledgeStore>,
    retriever: KnowledgeRetriever,
    publisher: DeliverablePublisher,
    failures: FailureRouter,
    harvester: LearningHarvester,
    stages: StageCatalog,
}

impl StageProcessor {
    pub fn new(
        runner: Arc<dyn WorkerRunner>,
        store: Arc<dyn KnowledgeStore>,
        retriever: KnowledgeRetriever,
        publisher: DeliverablePublisher,
        failures: FailureRouter,
        harvester: LearningHarvester,
        stages: StageCatalog,
    ) -> Self {
        Self {
            runner,
            store,
            retriever,
            publisher,
            failures,
            harvester,
            stages,
        }
    }

    /// Process one `stage.started` event to completion.
    pub async fn process(&self, event: &StageEvent) -> StageResolution {
        let ordinal = self.stages.ordinal(&event.stage_name).unwrap_or_else(|| {
            warn!(stage = %event.stage_name, "Stage is not in the catalog; using ordinal 0");
            0
        });
        let task_type = task_type_for_stage(&event.stage_name);

        let knowledge = self
            .retriever
            .retrieve(&event.agent_id, &event.request_id, ordinal)
            .await;
        let context = ContextComposer::compose(event, &task_type, &knowledge);

        info!(
            request_id = %event.request_id,
            agent_id = %event.agent_id,
            stage = %event.stage_name,
            ordinal,
            "Dispatching worker"
        );

        let output = match self.runner.run(&event.agent_id, &context).await {
            WorkerOutcome::SpawnFailed { reason, .. } => {
                return self.fail(event, FailureCause::SpawnFailed { reason }).await;
            }
            WorkerOutcome::Exited(output) if !output.succeeded() => {
                return self.fail(event, FailureCause::WorkerExit(output)).await;
            }
            WorkerOutcome::Exited(output) => output,
        };

        match self.publisher.publish(event, ordinal, &output).await {
            Ok(PublishOutcome::Published { locator, notice }) => {
                self.harvester
                    .harvest_into(self.store.as_ref(), &event.agent_id, &output.stdout, Some(&notice))
                    .await;
                StageResolution::Published { locator }
            }
            Ok(PublishOutcome::Unparsed) => {
                self.harvester
                    .harvest_into(self.store.as_ref(), &event.agent_id, &output.stdout, None)
                    .await;
                StageResolution::Unparsed
            }
            Err(e) => {
                self.fail(
                    event,
                    FailureCause::PublishFailed {
                        reason: e.to_string(),
                        output,
                    },
                )
                .await
            }
        }
    }

    async fn fail(&self, event: &StageEvent, cause: FailureCause) -> StageResolution {
        self.failures.route(event, &cause).await;
        StageResolution::Failed {
            reason: cause.describe(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use async_trait::async_trait;

    use conduit_bus::{identities_for, DeliverableExchange, InMemoryBus, MessageBus, StreamRegistry};
    use conduit_core::{AuditKind, RetentionSettings};
    use conduit_worker::WorkerOutput;

    use super::*;
    use crate::persistence::InMemoryKnowledgeStore;

    struct FixedRunner(WorkerOutcome);

    #[async_trait]
    impl WorkerRunner for FixedRunner {
        async fn run(&self, _agent_id: &str, _context: &str) -> WorkerOutcome {
            self.0.clone()
        }
    }

    fn exited(stdout: &str) -> WorkerOutcome {
        WorkerOutcome::Exited(WorkerOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
        })
    }

    async fn processor(outcome: WorkerOutcome) -> (Arc<InMemoryKnowledgeStore>, StageProcessor) {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        StreamRegistry::new(Arc::clone(&bus), RetentionSettings::default())
            .ensure_all(&identities_for(["cynthia"]).unwrap())
            .await
            .unwrap();

        let memory = Arc::new(InMemoryKnowledgeStore::new());
        let store: Arc<dyn KnowledgeStore> = memory.clone();
        let processor = StageProcessor::new(
            Arc::new(FixedRunner(outcome)),
            Arc::clone(&store),
            KnowledgeRetriever::new(Arc::clone(&store), 5),
            DeliverablePublisher::new(DeliverableExchange::new(Arc::clone(&bus), 1 << 20), Arc::clone(&store), 1024),
            FailureRouter::new(bus, Arc::clone(&store), 1024),
            LearningHarvester::new(5),
            StageCatalog::default(),
        );
        (memory, processor)
    }

    #[tokio::test]
    async fn test_spawn_failure_is_routed() {
        let (store, processor) = processor(WorkerOutcome::SpawnFailed {
            agent_id: "cynthia".to_string(),
            reason: "No such file or directory".to_string(),
        })
        .await;

        let resolution = processor
            .process(&StageEvent::started("REQ-1", "Research", "cynthia"))
            .await;

        assert!(matches!(&resolution, StageResolution::Failed { reason } if reason.contains("No such file")));
        let records = store.all_audit_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records.first().map(|r| r.kind), Some(AuditKind::Failure));
    }

    #[tokio::test]
    async fn test_unknown_stage_uses_ordinal_zero() {
        let (store, processor) = processor(exited(r#"{"status":"complete","agent":"cynthia"}"#)).await;

        let resolution = processor
            .process(&StageEvent::started("REQ-2", "Retrospective", "cynthia"))
            .await;

        assert!(matches!(resolution, StageResolution::Published { .. }));
        let rows = store.deliverables_for_request("REQ-2").await.unwrap();
        assert_eq!(rows.first().map(|r| r.stage_ordinal), Some(0));
        assert_eq!(
            rows.first().map(|r| r.subject.as_str()),
            Some("deliverables.cynthia.retrospective.REQ-2")
        );
    }

    #[tokio::test]
    async fn test_unprovisioned_agent_fails_at_publish() {
        let (store, processor) = processor(exited(r#"{"status":"complete","agent":"zed"}"#)).await;

        let resolution = processor
            .process(&StageEvent::started("REQ-3", "Research", "zed"))
            .await;

        assert!(matches!(&resolution, StageResolution::Failed { reason } if reason.starts_with("deliverable publish failed")));
        assert!(store.deliverables_for_request("REQ-3").await.unwrap().is_empty());
        assert_eq!(store.audit_records("REQ-3").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_output_beyond_message_limit_still_publishes() {
        let mut stdout = "compiling...\n".repeat(200_000);
        stdout.push_str(r#"{"status":"complete","agent":"cynthia","summary":"built"}"#);
        let (store, processor) = processor(exited(&stdout)).await;

        let resolution = processor
            .process(&StageEvent::started("REQ-5", "Research", "cynthia"))
            .await;

        assert!(matches!(resolution, StageResolution::Published { .. }));
        assert_eq!(store.deliverables_for_request("REQ-5").await.unwrap().len(), 1);
        assert!(store.audit_records("REQ-5").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unparsed_output_resolves_without_deliverable() {
        let (store, processor) = processor(exited("all done, no notice\nTIP: run the linter first")).await;

        let resolution = processor
            .process(&StageEvent::started("REQ-4", "Backend", "cynthia"))
            .await;

        assert_eq!(resolution, StageResolution::Unparsed);
        let records = store.audit_records("REQ-4").await.unwrap();
        assert_eq!(records.first().map(|r| r.kind), Some(AuditKind::Change));
        assert_eq!(store.all_learnings().await.len(), 1);
    }
}
