//! In-memory knowledge store for tests and dry runs.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use conduit_core::{AuditRecord, DeliverableCacheRow, Learning};

use super::error::{PersistenceError, PersistenceResult};
use super::store::KnowledgeStore;

#[derive(Debug, Default)]
pub struct InMemoryKnowledgeStore {
    deliverables: RwLock<BTreeMap<String, DeliverableCacheRow>>,
    audit: RwLock<Vec<AuditRecord>>,
    learnings: RwLock<Vec<Learning>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryKnowledgeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Every audit record, across requests.
    pub async fn all_audit_records(&self) -> Vec<AuditRecord> {
        self.audit.read().await.clone()
    }

    /// Every learning, across agents.
    pub async fn all_learnings(&self) -> Vec<Learning> {
        self.learnings.read().await.clone()
    }

    fn check_writable(&self) -> PersistenceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistenceError::connection_failed("store is closed"));
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(PersistenceError::query_failed("write rejected"));
        }
        Ok(())
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn upsert_deliverable(&self, row: &DeliverableCacheRow) -> PersistenceResult<()> {
        self.check_writable()?;
        self.deliverables
            .write()
            .await
            .insert(row.cache_key(), row.clone());
        Ok(())
    }

    async fn deliverables_for_request(
        &self,
        request_id: &str,
    ) -> PersistenceResult<Vec<DeliverableCacheRow>> {
        let mut rows: Vec<DeliverableCacheRow> = self
            .deliverables
            .read()
            .await
            .values()
            .filter(|row| row.request_id == request_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.stage_ordinal);
        Ok(rows)
    }

    async fn append_audit(&self, record: &AuditRecord) -> PersistenceResult<()> {
        self.check_writable()?;
        self.audit.write().await.push(record.clone());
        Ok(())
    }

    async fn audit_records(&self, request_id: &str) -> PersistenceResult<Vec<AuditRecord>> {
        Ok(self
            .audit
            .read()
            .await
            .iter()
            .filter(|record| record.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn append_learnings(&self, learnings: &[Learning]) -> PersistenceResult<usize> {
        self.check_writable()?;
        self.learnings.write().await.extend_from_slice(learnings);
        Ok(learnings.len())
    }

    async fn top_learnings(&self, agent_id: &str, limit: usize) -> PersistenceResult<Vec<Learning>> {
        let mut learnings: Vec<Learning> = self
            .learnings
            .read()
            .await
            .iter()
            .filter(|l| l.agent_id == agent_id)
            .cloned()
            .collect();
        learnings.sort_by(|a, b| {
            b.confidence_score
                .partial_cmp(&a.confidence_score)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| b.times_applied.cmp(&a.times_applied))
        });
        learnings.truncate(limit);
        Ok(learnings)
    }

    async fn close(&self) -> PersistenceResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
