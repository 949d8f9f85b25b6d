//! # conduit-bus
//!
//! Durable bus plumbing for Conduit.
//!
//! - [`MessageBus`]: the broker seam, with [`JetStreamBus`] for production
//!   and [`InMemoryBus`] for tests
//! - [`StreamRegistry`]: idempotent per-identity stream provisioning
//! - [`DeliverableExchange`]: keyed deliverable publish and fetch-latest

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod backend;
pub mod error;
pub mod exchange;
pub mod jetstream;
pub mod memory;
pub mod registry;
pub mod subject;

pub use backend::{
    Acknowledge, ConsumerSpec, Delivery, DeliveryStream, MessageBus, PublishReceipt, StoredMessage,
};
pub use error::{BusError, BusResult};
pub use exchange::DeliverableExchange;
pub use jetstream::JetStreamBus;
pub use memory::{AckOutcome, AckRecord, InMemoryBus};
pub use registry::{
    agent_stream_name, identities_for, StreamIdentity, StreamProvision, StreamRegistry,
    ORCHESTRATION_STREAM,
};
pub use subject::{
    deliverable_subject, subject_matches, task_type_for_stage, STAGE_FAILED_SUBJECT,
    STAGE_STARTED_SUBJECT,
};
