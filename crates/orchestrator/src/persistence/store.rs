//! The knowledge store seam.

use async_trait::async_trait;

use conduit_core::{AuditRecord, DeliverableCacheRow, Learning};

use super::error::PersistenceResult;

/// Durable knowledge shared across dispatches: deliverable cache rows,
/// audit records and harvested learnings.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Insert or replace the cache row keyed by (request, agent, ordinal).
    async fn upsert_deliverable(&self, row: &DeliverableCacheRow) -> PersistenceResult<()>;

    /// All cache rows of a request, ordered by stage ordinal.
    async fn deliverables_for_request(
        &self,
        request_id: &str,
    ) -> PersistenceResult<Vec<DeliverableCacheRow>>;

    /// Cache rows of a request that precede `stage_ordinal`.
    ///
    /// Ordinal 0 marks a stage outside the catalog; every cached row counts
    /// as prior for it.
    async fn prior_decisions(
        &self,
        request_id: &str,
        stage_ordinal: u32,
    ) -> PersistenceResult<Vec<DeliverableCacheRow>> {
        let rows = self.deliverables_for_request(request_id).await?;
        Ok(rows
            .into_iter()
            .filter(|row| stage_ordinal == 0 || row.stage_ordinal < stage_ordinal)
            .collect())
    }

    /// Append a change or failure record.
    async fn append_audit(&self, record: &AuditRecord) -> PersistenceResult<()>;

    /// Audit records of a request in insertion order.
    async fn audit_records(&self, request_id: &str) -> PersistenceResult<Vec<AuditRecord>>;

    /// Append learnings; returns how many were written.
    async fn append_learnings(&self, learnings: &[Learning]) -> PersistenceResult<usize>;

    /// An agent's best learnings by confidence, then times applied.
    async fn top_learnings(&self, agent_id: &str, limit: usize) -> PersistenceResult<Vec<Learning>>;

    /// Release the underlying connection.
    async fn close(&self) -> PersistenceResult<()>;
}
