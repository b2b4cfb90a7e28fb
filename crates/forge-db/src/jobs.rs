//! Job ledger implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use forge_core::{
    CancelOutcome, Error, FailureReason, JobFilter, JobLedger, JobStatus, Result, StatusUpdate,
    TrainingJob,
};

const JOB_COLUMNS: &str = "id, branch, dataset_path, policy_json, status, data_points, \
     cancel_requested, created_at, started_at, finished_at, metrics_json, error";

/// SQLite implementation of the job ledger.
///
/// Every cross-task coordination point (duplicate-job guard, claim) is a
/// single SQL statement, so correctness does not depend on in-memory locks
/// and survives process restarts.
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: SqliteRow) -> Result<TrainingJob> {
        let id: String = row.try_get("id").map_err(Error::Database)?;
        let policy_json: String = row.try_get("policy_json").map_err(Error::Database)?;
        let status: String = row.try_get("status").map_err(Error::Database)?;
        let metrics_json: Option<String> = row.try_get("metrics_json").map_err(Error::Database)?;

        let metrics: BTreeMap<String, f64> = match metrics_json {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BTreeMap::new(),
        };

        Ok(TrainingJob {
            id: Uuid::parse_str(&id).map_err(|e| Error::Serialization(e.to_string()))?,
            branch: row.try_get("branch").map_err(Error::Database)?,
            dataset_path: row.try_get("dataset_path").map_err(Error::Database)?,
            policy: serde_json::from_str(&policy_json)?,
            status: JobStatus::parse(&status)
                .ok_or_else(|| Error::Serialization(format!("unknown job status: {}", status)))?,
            data_points: row.try_get("data_points").map_err(Error::Database)?,
            cancel_requested: row
                .try_get::<i64, _>("cancel_requested")
                .map_err(Error::Database)?
                != 0,
            created_at: row.try_get("created_at").map_err(Error::Database)?,
            started_at: row.try_get("started_at").map_err(Error::Database)?,
            finished_at: row.try_get("finished_at").map_err(Error::Database)?,
            metrics,
            error: row.try_get("error").map_err(Error::Database)?,
        })
    }
}

#[async_trait]
impl JobLedger for SqliteJobRepository {
    async fn create_job(&self, job: &TrainingJob) -> Result<Uuid> {
        let policy_json = serde_json::to_string(&job.policy)?;

        // Atomic check-and-insert: the duplicate-active-job invariant is
        // enforced by the statement itself, not by a prior read, so
        // concurrent scheduling passes cannot race past each other.
        let inserted: Option<String> = sqlx::query_scalar(
            "INSERT INTO training_jobs
                 (id, branch, dataset_path, policy_json, status, data_points,
                  cancel_requested, created_at)
             SELECT ?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6
             WHERE NOT EXISTS (
                 SELECT 1 FROM training_jobs
                 WHERE branch = ?2 AND status IN ('pending', 'running')
             )
             RETURNING id",
        )
        .bind(job.id.to_string())
        .bind(&job.branch)
        .bind(&job.dataset_path)
        .bind(&policy_json)
        .bind(job.data_points)
        .bind(job.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match inserted {
            Some(_) => {
                info!(
                    subsystem = "ledger",
                    op = "create_job",
                    job_id = %job.id,
                    branch = %job.branch,
                    data_points = job.data_points,
                    "Job created"
                );
                Ok(job.id)
            }
            None => Err(Error::DuplicateActiveJob(job.branch.clone())),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        update: StatusUpdate,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM training_jobs WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Database)?;

        let current = match current {
            Some(s) => JobStatus::parse(&s)
                .ok_or_else(|| Error::Serialization(format!("unknown job status: {}", s)))?,
            None => return Err(Error::NotFound(id)),
        };

        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: current,
                to: status,
            });
        }

        let metrics_json = match &update.metrics {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };

        sqlx::query(
            "UPDATE training_jobs
             SET status = ?1,
                 started_at = COALESCE(?2, started_at),
                 finished_at = COALESCE(?3, finished_at),
                 metrics_json = COALESCE(?4, metrics_json),
                 error = COALESCE(?5, error)
             WHERE id = ?6",
        )
        .bind(status.as_str())
        .bind(update.started_at)
        .bind(update.finished_at)
        .bind(metrics_json)
        .bind(&update.error)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn claim_next_pending(&self) -> Result<Option<TrainingJob>> {
        // Single-statement claim: SQLite serializes writers, so at most one
        // caller observes any given pending row. Oldest first.
        let row = sqlx::query(&format!(
            "UPDATE training_jobs
             SET status = 'running', started_at = ?1
             WHERE id = (
                 SELECT id FROM training_jobs
                 WHERE status = 'pending'
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<TrainingJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM training_jobs WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<TrainingJob>> {
        let mut conditions = Vec::new();
        if filter.branch.is_some() {
            conditions.push("branch = ?1");
        }
        if filter.status.is_some() {
            conditions.push("status = ?2");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {JOB_COLUMNS} FROM training_jobs
             {where_clause}
             ORDER BY created_at DESC
             LIMIT ?3"
        );

        let rows = sqlx::query(&query)
            .bind(filter.branch.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn active_job_for_branch(&self, branch: &str) -> Result<Option<TrainingJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM training_jobs
             WHERE branch = ?1 AND status IN ('pending', 'running')
             LIMIT 1"
        ))
        .bind(branch)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn last_terminal_finish(&self, branch: &str) -> Result<Option<DateTime<Utc>>> {
        let finished: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT finished_at FROM training_jobs
             WHERE branch = ?1
               AND status IN ('completed', 'failed', 'cancelled')
               AND finished_at IS NOT NULL
             ORDER BY finished_at DESC
             LIMIT 1",
        )
        .bind(branch)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(finished)
    }

    async fn running_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM training_jobs WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }

    async fn recover_stale_running_jobs(&self) -> Result<Vec<Uuid>> {
        // Jobs left Running by a crashed process: the child is no longer
        // tracked and cannot be resumed, only declared failed.
        let ids: Vec<String> = sqlx::query_scalar(
            "UPDATE training_jobs
             SET status = 'failed', finished_at = ?1, error = ?2
             WHERE status = 'running'
             RETURNING id",
        )
        .bind(Utc::now())
        .bind(FailureReason::InterruptedByRestart.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let ids: Vec<Uuid> = ids
            .iter()
            .map(|s| Uuid::parse_str(s).map_err(|e| Error::Serialization(e.to_string())))
            .collect::<Result<_>>()?;

        if !ids.is_empty() {
            warn!(
                subsystem = "ledger",
                op = "recover_stale",
                count = ids.len(),
                "Recovered jobs left running by a previous process"
            );
        }
        Ok(ids)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome> {
        // Pending first: withdrawing before a worker claims the job.
        let cancelled = sqlx::query(
            "UPDATE training_jobs
             SET status = 'cancelled', finished_at = ?1
             WHERE id = ?2 AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if cancelled.rows_affected() > 0 {
            info!(subsystem = "ledger", op = "cancel", job_id = %id, "Pending job cancelled");
            return Ok(CancelOutcome::CancelledPending);
        }

        // Running: flag it; the executor polls the flag and kills the child.
        let flagged = sqlx::query(
            "UPDATE training_jobs SET cancel_requested = 1
             WHERE id = ?1 AND status = 'running'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if flagged.rows_affected() > 0 {
            info!(subsystem = "ledger", op = "cancel", job_id = %id, "Cancel requested for running job");
            return Ok(CancelOutcome::CancelRequested);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM training_jobs WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        match status {
            Some(s) => {
                let status = JobStatus::parse(&s)
                    .ok_or_else(|| Error::Serialization(format!("unknown job status: {}", s)))?;
                Ok(CancelOutcome::AlreadyTerminal(status))
            }
            None => Err(Error::NotFound(id)),
        }
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool> {
        let flag: Option<i64> =
            sqlx::query_scalar("SELECT cancel_requested FROM training_jobs WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        match flag {
            Some(v) => Ok(v != 0),
            None => Err(Error::NotFound(id)),
        }
    }
}
