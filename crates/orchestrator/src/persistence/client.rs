//! SurrealDB connection for the knowledge store.

use std::sync::Arc;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tracing::info;

use conduit_core::StoreSettings;

use super::error::{from_surrealdb_error, PersistenceResult};

/// Connection to the knowledge database.
#[derive(Debug, Clone)]
pub struct KnowledgeDb {
    db: Arc<Surreal<Any>>,
    settings: StoreSettings,
}

impl KnowledgeDb {
    /// Connect, authenticate if credentials are set, and select the
    /// namespace and database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or authentication fails.
    pub async fn connect(settings: StoreSettings) -> PersistenceResult<Self> {
        let db = Surreal::<Any>::init();

        db.connect(settings.url.as_str())
            .await
            .map_err(from_surrealdb_error)?;

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await
            .map_err(from_surrealdb_error)?;
        }

        db.use_ns(settings.namespace.as_str())
            .use_db(settings.database.as_str())
            .await
            .map_err(from_surrealdb_error)?;

        info!(url = %settings.url, namespace = %settings.namespace, database = %settings.database, "Connected to knowledge store");

        Ok(Self {
            db: Arc::new(db),
            settings,
        })
    }

    /// In-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedded engine cannot start.
    pub async fn in_memory() -> PersistenceResult<Self> {
        Self::connect(StoreSettings::default()).await
    }

    #[must_use]
    pub fn db(&self) -> &Surreal<Any> {
        &self.db
    }

    #[must_use]
    pub const fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Define tables and indexes.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub async fn initialize_schema(&self) -> PersistenceResult<()> {
        let schema = include_str!("schema.surql");
        self.db
            .query(schema)
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;
        Ok(())
    }

    /// Verify connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the database does not answer.
    pub async fn health_check(&self) -> PersistenceResult<()> {
        self.db
            .query("INFO FOR DB")
            .await
            .map_err(from_surrealdb_error)?;
        Ok(())
    }
}
