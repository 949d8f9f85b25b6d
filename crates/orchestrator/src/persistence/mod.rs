//! Knowledge persistence: deliverable cache, audit trail and learnings.
//!
//! [`KnowledgeStore`] is implemented on SurrealDB for production and in
//! memory for tests.

pub mod client;
pub mod error;
pub mod memory;
pub mod store;
pub mod surreal;

pub use client::KnowledgeDb;
pub use error::{from_surrealdb_error, PersistenceError, PersistenceResult};
pub use memory::InMemoryKnowledgeStore;
pub use store::KnowledgeStore;
pub use surreal::SurrealKnowledgeStore;
