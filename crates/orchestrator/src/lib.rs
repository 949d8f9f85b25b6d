//! # conduit-orchestrator
//!
//! Turns `stage.started` events into bounded worker runs and routes each
//! result: deliverables to the agent's stream, failures to
//! `stage.failed`, and knowledge into the store.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod dispatcher;
pub mod error;
pub mod failure;
pub mod harvester;
pub mod knowledge;
pub mod persistence;
pub mod pipeline;
pub mod publisher;
pub mod runtime;
pub mod shutdown;

pub use dispatcher::{DispatchSlot, DispatchSlots, DispatchStats, Dispatcher};
pub use error::{OrchestratorError, OrchestratorResult};
pub use failure::{truncate_for_audit, FailureCause, FailureRouted, FailureRouter};
pub use harvester::{classify, LearningHarvester};
pub use knowledge::{ContextComposer, KnowledgeRetriever, KnowledgeSnapshot};
pub use persistence::{
    InMemoryKnowledgeStore, KnowledgeDb, KnowledgeStore, PersistenceError, PersistenceResult,
    SurrealKnowledgeStore,
};
pub use pipeline::{StageProcessor, StageResolution};
pub use publisher::{DeliverablePublisher, PublishOutcome};
pub use runtime::Conductor;
pub use shutdown::{
    install_signal_handlers, ShutdownCoordinator, ShutdownPhase, ShutdownReport, ShutdownSignal,
};
