#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # conduit-worker
//!
//! Runs CLI agents as child processes and reads their completion notices.
//!
//! ```ignore
//! use conduit_worker::{parse_completion_notice, ProcessSupervisor, WorkerOutcome, WorkerRunner};
//!
//! let supervisor = ProcessSupervisor::new(config.workers.clone());
//! if let WorkerOutcome::Exited(output) = supervisor.run("cynthia", &context).await {
//!     let notice = parse_completion_notice(&output.stdout);
//! }
//! ```

pub mod error;
pub mod notice;
pub mod supervisor;

pub use error::{WorkerError, WorkerResult};
pub use notice::{parse_completion_notice, parse_completion_notice_bytes, NoticeParse};
pub use supervisor::{
    LaunchPlan, ProcessSupervisor, WorkerOutcome, WorkerOutput, WorkerRunner, AGENT_ID_ENV,
    MODEL_ENV,
};
