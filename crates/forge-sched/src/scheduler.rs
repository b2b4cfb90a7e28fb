//! Job scheduling: snapshot the dataset, record a Pending job, wake the
//! worker pool.
//!
//! The duplicate-active-job guard lives in the ledger's `create_job`, so
//! concurrent schedule calls for the same branch (monitor tick racing a
//! manual `schedule` command) converge on one job.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use forge_core::{Error, JobLedger, Result, TrainingDataSource, TrainingJob};

#[derive(Clone)]
pub struct JobScheduler {
    ledger: Arc<dyn JobLedger>,
    source: Arc<dyn TrainingDataSource>,
    wake_tx: mpsc::Sender<()>,
}

impl JobScheduler {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        source: Arc<dyn TrainingDataSource>,
        wake_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            ledger,
            source,
            wake_tx,
        }
    }

    /// Schedule a training job for the branch, consuming at most
    /// `data_hint` data points. If the branch already has a Pending or
    /// Running job, that existing job is returned instead of a new one.
    pub async fn schedule(
        &self,
        policy: &forge_core::BranchPolicy,
        data_hint: u64,
    ) -> Result<TrainingJob> {
        let snapshot = self.source.export_snapshot(&policy.branch, data_hint).await?;
        let job = TrainingJob::new(
            policy.clone(),
            snapshot.display().to_string(),
            data_hint,
        );

        match self.ledger.create_job(&job).await {
            Ok(id) => {
                info!(
                    subsystem = "scheduler",
                    op = "schedule",
                    branch = %policy.branch,
                    job_id = %id,
                    data_points = data_hint,
                    dataset = %job.dataset_path,
                    "Training job scheduled"
                );
                // Best effort: a full channel means the pool will claim on
                // its next sweep anyway.
                if self.wake_tx.try_send(()).is_err() {
                    debug!(subsystem = "scheduler", "Wake channel full, pool will sweep");
                }
                Ok(job)
            }
            Err(Error::DuplicateActiveJob(branch)) => {
                warn!(
                    subsystem = "scheduler",
                    op = "schedule",
                    branch = %branch,
                    "Branch already has an active job"
                );
                self.ledger
                    .active_job_for_branch(&branch)
                    .await?
                    .ok_or_else(|| {
                        Error::Internal(format!(
                            "active job for branch {branch} vanished during schedule"
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }
}
