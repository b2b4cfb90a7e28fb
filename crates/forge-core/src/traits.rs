//! Trait seams between the scheduler and its collaborators.
//!
//! The ledger is the only shared mutable resource: all cross-component
//! coordination (duplicate-job avoidance, exactly-once claims) is expressed
//! as atomic ledger operations so the monitor and the pool stay
//! independently restart-safe.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    CancelOutcome, JobFilter, JobStatus, StatusUpdate, TrainedArtifact, TrainingJob,
};

/// Durable store of training job records.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Insert a new Pending job. Checked and inserted atomically: fails with
    /// [`Error::DuplicateActiveJob`](crate::Error::DuplicateActiveJob) if a
    /// non-terminal job already exists for the branch.
    async fn create_job(&self, job: &TrainingJob) -> Result<Uuid>;

    /// Apply a status transition plus associated fields. Fails with
    /// `NotFound` for unknown ids and `InvalidTransition` for moves the
    /// state machine forbids.
    async fn update_status(&self, id: Uuid, status: JobStatus, update: StatusUpdate)
        -> Result<()>;

    /// Atomically claim the oldest Pending job, moving it to Running. At
    /// most one caller observes any given job.
    async fn claim_next_pending(&self) -> Result<Option<TrainingJob>>;

    async fn get_job(&self, id: Uuid) -> Result<Option<TrainingJob>>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<TrainingJob>>;

    /// The branch's Pending or Running job, if any.
    async fn active_job_for_branch(&self, branch: &str) -> Result<Option<TrainingJob>>;

    /// Finish time of the branch's most recent terminal job (cooldown guard).
    async fn last_terminal_finish(&self, branch: &str) -> Result<Option<DateTime<Utc>>>;

    async fn running_count(&self) -> Result<i64>;

    /// Startup recovery: jobs left Running by a crashed process are moved to
    /// Failed with reason `interrupted_by_restart`. Returns affected ids.
    async fn recover_stale_running_jobs(&self) -> Result<Vec<Uuid>>;

    /// Operator cancel. Pending jobs are cancelled outright; Running jobs
    /// get `cancel_requested` set for the executor to observe.
    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome>;

    /// Whether an operator has requested cancellation of this job.
    async fn cancel_requested(&self, id: Uuid) -> Result<bool>;
}

/// Durable store of trained-artifact records.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Insert the artifact as active, deactivating the branch's previous
    /// active artifact in the same transaction.
    async fn upsert_artifact(&self, artifact: &TrainedArtifact) -> Result<()>;

    async fn get_active_artifact(&self, branch: &str) -> Result<Option<TrainedArtifact>>;

    async fn list_artifacts(&self, branch: &str) -> Result<Vec<TrainedArtifact>>;
}

/// External collaborator producing per-branch training data.
#[async_trait]
pub trait TrainingDataSource: Send + Sync {
    /// Number of accumulated data points not yet consumed by a training run.
    async fn count_unconsumed(&self, branch: &str) -> Result<u64>;

    /// Export a dataset snapshot of at most `cap` data points, returning its
    /// path. Fails with `DatasetUnavailable` when no snapshot can be made.
    async fn export_snapshot(&self, branch: &str, cap: u64) -> Result<PathBuf>;
}
