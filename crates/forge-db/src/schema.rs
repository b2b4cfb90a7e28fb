//! Embedded ledger schema, applied idempotently at connect time.

use sqlx::SqlitePool;

use forge_core::{Error, Result};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS training_jobs (
        id               TEXT PRIMARY KEY,
        branch           TEXT NOT NULL,
        dataset_path     TEXT NOT NULL,
        policy_json      TEXT NOT NULL,
        status           TEXT NOT NULL DEFAULT 'pending',
        data_points      INTEGER NOT NULL DEFAULT 0,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        created_at       TEXT NOT NULL,
        started_at       TEXT,
        finished_at      TEXT,
        metrics_json     TEXT,
        error            TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_training_jobs_branch_status
        ON training_jobs (branch, status)",
    "CREATE INDEX IF NOT EXISTS idx_training_jobs_status_created
        ON training_jobs (status, created_at)",
    "CREATE TABLE IF NOT EXISTS trained_artifacts (
        id            TEXT PRIMARY KEY,
        branch        TEXT NOT NULL,
        job_id        TEXT NOT NULL REFERENCES training_jobs (id),
        path          TEXT NOT NULL,
        metrics_json  TEXT,
        duration_secs REAL NOT NULL DEFAULT 0,
        created_at    TEXT NOT NULL,
        active        INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE INDEX IF NOT EXISTS idx_trained_artifacts_branch_active
        ON trained_artifacts (branch, active)",
];

/// Apply the ledger schema. Safe to call on every startup.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(Error::Database)?;
    }
    Ok(())
}
