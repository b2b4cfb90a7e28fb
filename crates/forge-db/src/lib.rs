//! # forge-db
//!
//! SQLite-backed job ledger and artifact store for branchforge.
//!
//! The ledger is the single source of truth for job state: it survives
//! restarts, and every coordination-sensitive operation (duplicate-job
//! guard, claim, artifact activation) is a single atomic statement or
//! transaction.

pub mod artifacts;
pub mod jobs;
pub mod pool;
pub mod schema;

use std::sync::Arc;

use sqlx::SqlitePool;

use forge_core::Result;

pub use artifacts::SqliteArtifactRepository;
pub use jobs::SqliteJobRepository;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};

/// Handle bundling the connection pool with its repositories.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    pub jobs: Arc<SqliteJobRepository>,
    pub artifacts: Arc<SqliteArtifactRepository>,
}

impl Database {
    /// Connect to the ledger, creating the file and schema if needed.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    /// Build a Database from an existing pool, applying the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        schema::apply_schema(&pool).await?;
        Ok(Self {
            jobs: Arc::new(SqliteJobRepository::new(pool.clone())),
            artifacts: Arc::new(SqliteArtifactRepository::new(pool.clone())),
            pool,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
