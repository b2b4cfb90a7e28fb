//! Eligibility monitor: periodically decides which branches are due for
//! training and hands them to the scheduler.
//!
//! A branch is eligible when it has no active job, its cooldown since the
//! last terminal job has elapsed, and its unconsumed data count meets the
//! policy minimum. Each branch is evaluated independently so one failing
//! branch never starves the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use forge_core::{BranchPolicy, Error, JobLedger, Result, TrainingDataSource, TrainingJob};

use crate::scheduler::JobScheduler;

/// Why a branch was not scheduled on this evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    ActiveJobExists,
    CoolingDown { remaining_secs: i64 },
    NotEnoughData { have: u64, need: u64 },
}

/// Outcome of a single branch evaluation.
#[derive(Debug)]
pub enum Evaluation {
    Scheduled(TrainingJob),
    Skipped(Ineligible),
}

pub struct EligibilityMonitor {
    ledger: Arc<dyn JobLedger>,
    source: Arc<dyn TrainingDataSource>,
    scheduler: JobScheduler,
    policies: Vec<BranchPolicy>,
    poll_interval: Duration,
}

/// Handle for stopping a running monitor.
pub struct MonitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.join.await;
    }
}

impl EligibilityMonitor {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        source: Arc<dyn TrainingDataSource>,
        scheduler: JobScheduler,
        policies: Vec<BranchPolicy>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            source,
            scheduler,
            policies,
            poll_interval,
        }
    }

    /// Spawn the polling loop. The first evaluation runs immediately.
    pub fn start(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let join = tokio::spawn(async move {
            info!(
                subsystem = "monitor",
                branches = self.policies.len(),
                poll_secs = self.poll_interval.as_secs(),
                "Eligibility monitor started"
            );
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "monitor", "Eligibility monitor stopping");
                        break;
                    }
                }
            }
        });
        MonitorHandle { shutdown_tx, join }
    }

    /// Evaluate every configured branch once.
    pub async fn tick(&self) {
        for policy in &self.policies {
            match self.evaluate(policy).await {
                Ok(Evaluation::Scheduled(job)) => {
                    info!(
                        subsystem = "monitor",
                        branch = %policy.branch,
                        job_id = %job.id,
                        "Branch eligible, job scheduled"
                    );
                }
                Ok(Evaluation::Skipped(reason)) => {
                    debug!(
                        subsystem = "monitor",
                        branch = %policy.branch,
                        reason = ?reason,
                        "Branch not eligible"
                    );
                }
                Err(e) => {
                    // Per-branch isolation: log and move on.
                    error!(
                        subsystem = "monitor",
                        branch = %policy.branch,
                        error = %e,
                        "Branch evaluation failed"
                    );
                }
            }
        }
    }

    /// Apply the eligibility rules to one branch and schedule if due.
    pub async fn evaluate(&self, policy: &BranchPolicy) -> Result<Evaluation> {
        if self.ledger.active_job_for_branch(&policy.branch).await?.is_some() {
            return Ok(Evaluation::Skipped(Ineligible::ActiveJobExists));
        }

        if let Some(finished) = self.ledger.last_terminal_finish(&policy.branch).await? {
            let elapsed = chrono::Utc::now() - finished;
            let cooldown = chrono::Duration::seconds(policy.cooldown_secs as i64);
            if elapsed < cooldown {
                return Ok(Evaluation::Skipped(Ineligible::CoolingDown {
                    remaining_secs: (cooldown - elapsed).num_seconds(),
                }));
            }
        }

        let count = self.source.count_unconsumed(&policy.branch).await?;
        if count < policy.min_data_points {
            return Ok(Evaluation::Skipped(Ineligible::NotEnoughData {
                have: count,
                need: policy.min_data_points,
            }));
        }

        let hint = count.min(policy.max_data_points);
        let job = self.scheduler.schedule(policy, hint).await?;
        Ok(Evaluation::Scheduled(job))
    }

    /// Evaluate a single branch by name, for the manual `schedule` command.
    pub async fn check_branch(&self, branch: &str) -> Result<Evaluation> {
        let policy = self
            .policies
            .iter()
            .find(|p| p.branch == branch)
            .ok_or_else(|| Error::Config(format!("no policy configured for branch '{branch}'")))?;
        self.evaluate(policy).await
    }
}
