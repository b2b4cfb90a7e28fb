//! Trained-artifact repository implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use forge_core::{ArtifactStore, Error, Result, TrainedArtifact};

const ARTIFACT_COLUMNS: &str =
    "id, branch, job_id, path, metrics_json, duration_secs, created_at, active";

/// SQLite implementation of the artifact store.
pub struct SqliteArtifactRepository {
    pool: SqlitePool,
}

impl SqliteArtifactRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_artifact_row(row: SqliteRow) -> Result<TrainedArtifact> {
        let id: String = row.try_get("id").map_err(Error::Database)?;
        let job_id: String = row.try_get("job_id").map_err(Error::Database)?;
        let metrics_json: Option<String> = row.try_get("metrics_json").map_err(Error::Database)?;

        let metrics: BTreeMap<String, f64> = match metrics_json {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BTreeMap::new(),
        };

        Ok(TrainedArtifact {
            id: Uuid::parse_str(&id).map_err(|e| Error::Serialization(e.to_string()))?,
            branch: row.try_get("branch").map_err(Error::Database)?,
            job_id: Uuid::parse_str(&job_id).map_err(|e| Error::Serialization(e.to_string()))?,
            path: row.try_get("path").map_err(Error::Database)?,
            metrics,
            duration_secs: row.try_get("duration_secs").map_err(Error::Database)?,
            created_at: row.try_get("created_at").map_err(Error::Database)?,
            active: row.try_get::<i64, _>("active").map_err(Error::Database)? != 0,
        })
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactRepository {
    async fn upsert_artifact(&self, artifact: &TrainedArtifact) -> Result<()> {
        let metrics_json = serde_json::to_string(&artifact.metrics)?;

        // One transaction: the previous active artifact is deactivated and
        // the new one inserted, so the one-active-per-branch invariant is
        // never observable as violated.
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("UPDATE trained_artifacts SET active = 0 WHERE branch = ?1 AND active = 1")
            .bind(&artifact.branch)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO trained_artifacts
                 (id, branch, job_id, path, metrics_json, duration_secs, created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
        )
        .bind(artifact.id.to_string())
        .bind(&artifact.branch)
        .bind(artifact.job_id.to_string())
        .bind(&artifact.path)
        .bind(&metrics_json)
        .bind(artifact.duration_secs)
        .bind(artifact.created_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "ledger",
            op = "upsert_artifact",
            artifact_id = %artifact.id,
            branch = %artifact.branch,
            job_id = %artifact.job_id,
            path = %artifact.path,
            "Artifact registered as active"
        );
        Ok(())
    }

    async fn get_active_artifact(&self, branch: &str) -> Result<Option<TrainedArtifact>> {
        let row = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM trained_artifacts
             WHERE branch = ?1 AND active = 1
             LIMIT 1"
        ))
        .bind(branch)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_artifact_row).transpose()
    }

    async fn list_artifacts(&self, branch: &str) -> Result<Vec<TrainedArtifact>> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM trained_artifacts
             WHERE branch = ?1
             ORDER BY created_at DESC"
        ))
        .bind(branch)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_artifact_row).collect()
    }
}
