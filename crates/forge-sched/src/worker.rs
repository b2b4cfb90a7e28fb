//! Worker pool: claims Pending jobs from the ledger and drives them
//! through the executor under a concurrency cap.
//!
//! Dispatch has two paths. The periodic sweep is the reliable one; wake
//! signals from the scheduler only shorten the latency between scheduling
//! and claiming. Claims go through the ledger's atomic claim, so a job is
//! observed by exactly one worker even if multiple pools share a ledger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use forge_core::{defaults, Error, FailureReason, JobLedger, JobStatus, StatusUpdate};

use crate::executor::JobExecutor;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_concurrent_jobs: usize,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: defaults::MAX_CONCURRENT_JOBS,
            sweep_interval: Duration::from_secs(defaults::SWEEP_INTERVAL_SECS),
            shutdown_grace: Duration::from_secs(defaults::SHUTDOWN_GRACE_SECS),
        }
    }
}

/// Pool lifecycle notifications, mainly for tests and the status surface.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    PoolStarted,
    JobStarted { job_id: Uuid, branch: String },
    JobFinished { job_id: Uuid },
    PoolStopped,
}

pub struct WorkerPool {
    core: PoolCore,
    wake_rx: mpsc::Receiver<()>,
}

/// Everything the run loop shares with its helpers. Kept apart from the
/// wake receiver so select arms can borrow the receiver mutably while
/// handlers use the core.
struct PoolCore {
    ledger: Arc<dyn JobLedger>,
    executor: Arc<JobExecutor>,
    config: WorkerPoolConfig,
    cancel_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<PoolEvent>,
}

/// Handle for stopping a running pool.
pub struct PoolHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl PoolHandle {
    /// Request shutdown and wait for in-flight jobs to drain (bounded by
    /// the pool's grace period).
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.join.await;
    }
}

impl WorkerPool {
    /// `cancel_tx` is the shutdown flag the executors watch; the pool sets
    /// it when draining begins.
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        executor: Arc<JobExecutor>,
        config: WorkerPoolConfig,
        wake_rx: mpsc::Receiver<()>,
        cancel_tx: watch::Sender<bool>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            core: PoolCore {
                ledger,
                executor,
                config,
                cancel_tx,
                event_tx,
            },
            wake_rx,
        }
    }

    /// Subscribe to pool lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.core.event_tx.subscribe()
    }

    pub fn start(self) -> PoolHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let join = tokio::spawn(self.run(shutdown_rx));
        PoolHandle { shutdown_tx, join }
    }

    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let WorkerPool { core, mut wake_rx } = self;

        info!(
            subsystem = "pool",
            max_concurrent = core.config.max_concurrent_jobs,
            sweep_secs = core.config.sweep_interval.as_secs(),
            "Worker pool started"
        );
        let _ = core.event_tx.send(PoolEvent::PoolStarted);

        let mut sweep = tokio::time::interval(core.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, Uuid> = HashMap::new();
        let mut wake_open = true;

        loop {
            core.claim_up_to_capacity(&mut tasks, &mut in_flight).await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = sweep.tick() => {}
                wake = wake_rx.recv(), if wake_open => {
                    // All senders gone: disable the arm and rely on the
                    // sweep, instead of treating the closed channel as a
                    // wake on every iteration.
                    if wake.is_none() {
                        wake_open = false;
                    }
                }
                joined = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    core.reap(joined, &mut in_flight).await;
                }
            }
        }

        core.drain(tasks, in_flight).await;
        let _ = core.event_tx.send(PoolEvent::PoolStopped);
        info!(subsystem = "pool", "Worker pool stopped");
    }
}

impl PoolCore {
    /// Claim Pending jobs until the concurrency cap is reached or the
    /// queue is empty.
    async fn claim_up_to_capacity(
        &self,
        tasks: &mut JoinSet<()>,
        in_flight: &mut HashMap<tokio::task::Id, Uuid>,
    ) {
        while tasks.len() < self.config.max_concurrent_jobs {
            let job = match self.ledger.claim_next_pending().await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    warn!(subsystem = "pool", error = %e, "Claim failed");
                    break;
                }
            };

            info!(
                subsystem = "pool",
                job_id = %job.id,
                branch = %job.branch,
                running = tasks.len() + 1,
                "Job claimed"
            );
            let _ = self.event_tx.send(PoolEvent::JobStarted {
                job_id: job.id,
                branch: job.branch.clone(),
            });

            let executor = self.executor.clone();
            let job_id = job.id;
            let task_id = tasks
                .spawn(async move {
                    executor.run(job).await;
                })
                .id();
            in_flight.insert(task_id, job_id);
        }
    }

    /// Handle one finished worker task. A panicking executor is recorded
    /// as a Failed job so the branch does not stay blocked.
    async fn reap(
        &self,
        joined: Option<std::result::Result<(tokio::task::Id, ()), JoinError>>,
        in_flight: &mut HashMap<tokio::task::Id, Uuid>,
    ) {
        match joined {
            Some(Ok((task_id, ()))) => {
                if let Some(job_id) = in_flight.remove(&task_id) {
                    let _ = self.event_tx.send(PoolEvent::JobFinished { job_id });
                }
            }
            Some(Err(join_err)) => {
                let task_id = join_err.id();
                if let Some(job_id) = in_flight.remove(&task_id) {
                    error!(
                        subsystem = "pool",
                        job_id = %job_id,
                        error = %join_err,
                        "Worker task aborted, marking job failed"
                    );
                    self.mark_interrupted(job_id, format!("worker task aborted: {join_err}"))
                        .await;
                    let _ = self.event_tx.send(PoolEvent::JobFinished { job_id });
                }
            }
            None => {}
        }
    }

    /// Graceful drain: flip the executor shutdown flag, give in-flight
    /// jobs the grace period to persist their terminal states, then abort
    /// whatever is left and record those jobs as interrupted.
    async fn drain(&self, mut tasks: JoinSet<()>, mut in_flight: HashMap<tokio::task::Id, Uuid>) {
        info!(
            subsystem = "pool",
            in_flight = tasks.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Draining worker pool"
        );
        let _ = self.cancel_tx.send(true);

        let grace = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(grace);

        while !tasks.is_empty() {
            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    self.reap(joined, &mut in_flight).await;
                }
                _ = &mut grace => break,
            }
        }

        if !tasks.is_empty() {
            warn!(
                subsystem = "pool",
                remaining = tasks.len(),
                "Shutdown grace expired, aborting workers"
            );
        }
        tasks.shutdown().await;
        for job_id in in_flight.into_values() {
            self.mark_interrupted(job_id, FailureReason::InterruptedByShutdown.to_string())
                .await;
        }
    }

    /// Best-effort Failed transition for a job whose executor never got to
    /// persist one. `InvalidTransition` means the executor finished first.
    async fn mark_interrupted(&self, job_id: Uuid, error_text: String) {
        let update = StatusUpdate::finished_now().with_error(error_text);
        match self
            .ledger
            .update_status(job_id, JobStatus::Failed, update)
            .await
        {
            Ok(()) | Err(Error::InvalidTransition { .. }) => {}
            Err(e) => {
                error!(
                    subsystem = "pool",
                    job_id = %job_id,
                    error = %e,
                    "Failed to mark interrupted job"
                );
            }
        }
    }
}
