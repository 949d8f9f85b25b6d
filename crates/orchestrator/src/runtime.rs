//! Wiring: builds the bus, store and worker runner from configuration and
//! runs the dispatcher until shutdown.

use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{error, info};

use conduit_bus::{
    identities_for, ConsumerSpec, DeliverableExchange, JetStreamBus, MessageBus, StreamIdentity,
    StreamProvision, StreamRegistry, ORCHESTRATION_STREAM,
};
use conduit_core::{ConductorConfig, GenericResultExt};
use conduit_worker::{ProcessSupervisor, WorkerRunner};

use crate::dispatcher::{DispatchSlots, Dispatcher};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::failure::FailureRouter;
use crate::harvester::LearningHarvester;
use crate::knowledge::KnowledgeRetriever;
use crate::persistence::{KnowledgeDb, KnowledgeStore, SurrealKnowledgeStore};
use crate::pipeline::StageProcessor;
use crate::publisher::DeliverablePublisher;
use crate::shutdown::{install_signal_handlers, ShutdownCoordinator, ShutdownReport};

/// A configured dispatch service.
pub struct Conductor {
    config: ConductorConfig,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn KnowledgeStore>,
    runner: Arc<dyn WorkerRunner>,
    shutdown: Arc<ShutdownCoordinator>,
    tracker: TaskTracker,
}

impl Conductor {
    /// Connect to the bus and the store, then provision every stream.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, an unreachable bus or store, or a
    /// stream that cannot be provisioned.
    pub async fn bootstrap(config: ConductorConfig) -> OrchestratorResult<Self> {
        config.validate()?;

        let bus = Arc::new(JetStreamBus::connect(&config.bus).await?);
        let db = KnowledgeDb::connect(config.store.clone()).await?;
        let store = Arc::new(SurrealKnowledgeStore::open(db).await?);
        let runner = Arc::new(ProcessSupervisor::new(config.workers.clone()));

        let conductor = Self::with_components(config, bus, store, runner);
        conductor.provision_streams().await?;
        Ok(conductor)
    }

    /// Assemble from already-built parts.
    pub fn with_components(
        config: ConductorConfig,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn KnowledgeStore>,
        runner: Arc<dyn WorkerRunner>,
    ) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new(config.shutdown.drain_timeout));
        Self {
            config,
            bus,
            store,
            runner,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    #[must_use]
    pub fn shutdown_coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Ensure the orchestration stream and one stream per configured agent.
    ///
    /// # Errors
    ///
    /// Returns the first provisioning failure.
    pub async fn provision_streams(&self) -> OrchestratorResult<Vec<(StreamIdentity, StreamProvision)>> {
        let identities = identities_for(self.config.workers.agent_ids())?;
        let registry = StreamRegistry::new(Arc::clone(&self.bus), self.config.retention.clone());
        let provisioned = registry.ensure_all(&identities).await?;
        let created = provisioned
            .iter()
            .filter(|(_, p)| *p == StreamProvision::Created)
            .count();
        info!(streams = provisioned.len(), created, "Streams provisioned");
        Ok(provisioned)
    }

    #[must_use]
    pub fn exchange(&self) -> DeliverableExchange {
        DeliverableExchange::new(
            Arc::clone(&self.bus),
            usize::try_from(self.config.retention.max_message_size).unwrap_or(usize::MAX),
        )
    }

    /// Build the dispatcher. Clones share counters and slots.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        let audit = &self.config.audit;
        let processor = StageProcessor::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.store),
            KnowledgeRetriever::new(Arc::clone(&self.store), audit.lessons_per_dispatch),
            DeliverablePublisher::new(self.exchange(), Arc::clone(&self.store), audit.max_raw_output_bytes),
            FailureRouter::new(Arc::clone(&self.bus), Arc::clone(&self.store), audit.max_raw_output_bytes),
            LearningHarvester::new(audit.max_learnings_per_run),
            self.config.stages.clone(),
        );
        Dispatcher::new(
            Arc::clone(&self.bus),
            processor,
            DispatchSlots::new(self.config.dispatch.max_concurrent_workers),
            self.config.dispatch.ack_mode,
            ConsumerSpec::from_settings(ORCHESTRATION_STREAM, &self.config.bus)
                .with_max_ack_pending(self.config.dispatch.max_ack_pending()),
            self.tracker.clone(),
            Arc::clone(&self.shutdown),
        )
    }

    /// Run until SIGINT or SIGTERM, then drain and release resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer could not be bound.
    pub async fn run(self) -> OrchestratorResult<ShutdownReport> {
        let _signals = install_signal_handlers(Arc::clone(&self.shutdown));
        self.run_until_shutdown(&self.dispatcher()).await
    }

    /// Drive `dispatcher` until shutdown is requested or its stream ends.
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's error after shutdown has completed.
    pub async fn run_until_shutdown(&self, dispatcher: &Dispatcher) -> OrchestratorResult<ShutdownReport> {
        let consumer = dispatcher.clone();
        let consumed = self
            .tracker
            .spawn(async move { consumer.run().await })
            .await
            .unwrap_or_else(|e| Err(OrchestratorError::bootstrap(format!("consume loop aborted: {e}"))))
            .tap_err(|e| error!(error = %e, retryable = e.is_retryable(), "Dispatcher stopped with an error"));
        let report = self
            .shutdown
            .shutdown(&self.tracker, self.bus.as_ref(), self.store.as_ref())
            .await;
        consumed.map(|()| report)
    }
}
