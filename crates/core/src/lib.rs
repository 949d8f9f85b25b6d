//! # conduit-core
//!
//! Shared vocabulary for Conduit: stage events, completion notices,
//! deliverables, stream descriptors, knowledge records, configuration,
//! and the core error type.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod event;
pub mod lenient;
pub mod result;
pub mod types;

pub use config::{
    AckMode, AgentProfile, AuditSettings, BusCredentials, BusSettings, ConductorConfig,
    DispatchSettings, ModelTier, RetentionSettings, ShutdownSettings, StageCatalog, StoreSettings,
    TierModels, WorkerSettings,
};
pub use error::Error;
pub use event::{StageEvent, StageFailedEvent, STAGE_FAILED, STAGE_STARTED};
pub use result::{GenericResultExt, Result};
pub use types::{
    agent_stream_name, cache_key, AuditKind, AuditRecord, CompletionNotice, Deliverable, DeliverableCacheRow,
    DeliverableLocator, DeliverableMetadata, DiscardPolicy, Learning, LearningType, NoticeStatus,
    StreamDescriptor,
};
