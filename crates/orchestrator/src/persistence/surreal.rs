//! SurrealDB-backed knowledge store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use conduit_core::{AuditRecord, DeliverableCacheRow, Learning};

use super::client::KnowledgeDb;
use super::error::{from_surrealdb_error, PersistenceError, PersistenceResult};
use super::store::KnowledgeStore;

/// Knowledge store on the `deliverable_cache`, `audit_record` and
/// `agent_learning` tables.
#[derive(Debug, Clone)]
pub struct SurrealKnowledgeStore {
    db: KnowledgeDb,
    closed: Arc<AtomicBool>,
}

impl SurrealKnowledgeStore {
    /// Wrap a connection and make sure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub async fn open(db: KnowledgeDb) -> PersistenceResult<Self> {
        db.initialize_schema().await?;
        Ok(Self {
            db,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> PersistenceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PersistenceError::connection_failed("knowledge store is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KnowledgeStore for SurrealKnowledgeStore {
    async fn upsert_deliverable(&self, row: &DeliverableCacheRow) -> PersistenceResult<()> {
        self.ensure_open()?;
        let key = row.cache_key();
        self.db
            .db()
            .query("UPSERT type::thing('deliverable_cache', $key) CONTENT $row RETURN NONE")
            .bind(("key", key.clone()))
            .bind(("row", row.clone()))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;
        debug!(key = %key, "Upserted deliverable cache row");
        Ok(())
    }

    async fn deliverables_for_request(
        &self,
        request_id: &str,
    ) -> PersistenceResult<Vec<DeliverableCacheRow>> {
        self.ensure_open()?;
        let rows: Vec<DeliverableCacheRow> = self
            .db
            .db()
            .query(
                "SELECT * OMIT id FROM deliverable_cache \
                 WHERE request_id = $request_id ORDER BY stage_ordinal ASC",
            )
            .bind(("request_id", request_id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;
        Ok(rows)
    }

    async fn append_audit(&self, record: &AuditRecord) -> PersistenceResult<()> {
        self.ensure_open()?;
        self.db
            .db()
            .query("CREATE audit_record CONTENT $record RETURN NONE")
            .bind(("record", record.clone()))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;
        Ok(())
    }

    async fn audit_records(&self, request_id: &str) -> PersistenceResult<Vec<AuditRecord>> {
        self.ensure_open()?;
        let records: Vec<AuditRecord> = self
            .db
            .db()
            .query(
                "SELECT * OMIT id FROM audit_record \
                 WHERE request_id = $request_id ORDER BY recorded_at ASC",
            )
            .bind(("request_id", request_id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;
        Ok(records)
    }

    async fn append_learnings(&self, learnings: &[Learning]) -> PersistenceResult<usize> {
        self.ensure_open()?;
        if learnings.is_empty() {
            return Ok(0);
        }
        self.db
            .db()
            .query("INSERT INTO agent_learning $rows RETURN NONE")
            .bind(("rows", learnings.to_vec()))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;
        Ok(learnings.len())
    }

    async fn top_learnings(&self, agent_id: &str, limit: usize) -> PersistenceResult<Vec<Learning>> {
        self.ensure_open()?;
        let learnings: Vec<Learning> = self
            .db
            .db()
            .query(
                "SELECT * OMIT id FROM agent_learning WHERE agent_id = $agent_id \
                 ORDER BY confidence_score DESC, times_applied DESC LIMIT $limit",
            )
            .bind(("agent_id", agent_id.to_string()))
            .bind(("limit", i64::try_from(limit).unwrap_or(i64::MAX)))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;
        Ok(learnings)
    }

    async fn close(&self) -> PersistenceResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.db.db().invalidate().await {
            debug!(error = %e, "Session invalidation on close failed");
        }
        info!(url = %self.db.settings().url, "Knowledge store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn test_operations_rejected_after_close() {
        let store = SurrealKnowledgeStore::open(KnowledgeDb::in_memory().await.unwrap())
            .await
            .unwrap();
        assert!(store.top_learnings("cynthia", 3).await.unwrap().is_empty());

        store.close().await.unwrap();
        store.close().await.unwrap();

        let after = store.top_learnings("cynthia", 3).await;
        assert!(matches!(after, Err(PersistenceError::ConnectionFailed { .. })));
        assert!(store.audit_records("REQ-1").await.is_err());
    }
}
