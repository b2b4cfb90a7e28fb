//! Training job execution: run directory setup, trainer subprocess
//! supervision, and terminal-state persistence.
//!
//! The executor owns exactly one child process at a time. The trainer is
//! started in its own process group so a timeout or cancel kills the whole
//! tree, not just the immediate child.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use forge_core::{
    defaults, parse_metric_lines, FailureReason, JobLedger, JobStatus, Result, SchedulerConfig,
    StatusUpdate, TrainingJob,
};

use crate::registry::ArtifactRegistry;

/// How much trainer output is preserved in the ledger's error column.
const OUTPUT_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Trainer program plus fixed leading arguments.
    pub trainer: Vec<String>,
    /// Directory under which per-job run directories are created.
    pub runs_dir: PathBuf,
    /// Timeout applied when the job's policy carries no override.
    pub default_timeout: Duration,
    /// Ledger polling interval for operator cancel requests.
    pub cancel_poll: Duration,
}

impl ExecutorConfig {
    pub fn from_scheduler_config(config: &SchedulerConfig) -> Self {
        Self {
            trainer: config.trainer.clone(),
            runs_dir: config.runs_dir.clone(),
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            cancel_poll: Duration::from_secs(defaults::CANCEL_POLL_SECS),
        }
    }
}

/// The spec file handed to the trainer as its single trailing argument.
#[derive(Debug, Serialize)]
struct ExecutionSpec<'a> {
    dataset_path: &'a str,
    base_model: &'a str,
    lora_r: u32,
    lora_alpha: u32,
    lora_dropout: f64,
    learning_rate: f64,
    num_epochs: u32,
    batch_size: u32,
    max_length: u32,
    output_dir: &'a str,
}

/// How one trainer invocation ended. Execution itself is infallible; every
/// problem collapses into a `Failed` outcome with a stable reason.
enum ExecOutcome {
    Completed {
        metrics: BTreeMap<String, f64>,
        output_dir: PathBuf,
    },
    Failed {
        reason: FailureReason,
        detail: Option<String>,
    },
}

pub struct JobExecutor {
    ledger: Arc<dyn JobLedger>,
    registry: ArtifactRegistry,
    config: ExecutorConfig,
    shutdown: watch::Receiver<bool>,
}

impl JobExecutor {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        registry: ArtifactRegistry,
        config: ExecutorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ledger,
            registry,
            config,
            shutdown,
        }
    }

    /// Run one claimed (already Running) job to a terminal state. Never
    /// returns an error: every failure path is persisted as a Failed job,
    /// and persistence failures are logged.
    pub async fn run(&self, job: TrainingJob) {
        let started = Instant::now();

        let outcome = if *self.shutdown.borrow() {
            ExecOutcome::Failed {
                reason: FailureReason::InterruptedByShutdown,
                detail: None,
            }
        } else {
            info!(
                subsystem = "executor",
                op = "run",
                job_id = %job.id,
                branch = %job.branch,
                dataset = %job.dataset_path,
                "Starting training job"
            );
            self.execute(&job).await
        };

        self.finalize(&job, outcome, started.elapsed()).await;
    }

    async fn execute(&self, job: &TrainingJob) -> ExecOutcome {
        let run_dir = self.config.runs_dir.join(job.id.to_string());
        let (spec_path, output_dir) = match self.prepare_run_dir(job, &run_dir) {
            Ok(paths) => paths,
            Err(e) => {
                return ExecOutcome::Failed {
                    reason: FailureReason::SpawnFailed {
                        message: format!("run directory setup: {e}"),
                    },
                    detail: None,
                }
            }
        };

        let mut command = Command::new(&self.config.trainer[0]);
        command
            .args(&self.config.trainer[1..])
            .arg(&spec_path)
            .current_dir(&run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so killing -pid takes the whole trainer tree.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecOutcome::Failed {
                    reason: FailureReason::SpawnFailed {
                        message: format!("{}: {}", self.config.trainer[0], e),
                    },
                    detail: None,
                }
            }
        };

        let stdout_task = child.stdout.take().map(drain);
        let stderr_task = child.stderr.take().map(drain);

        let timeout_secs = job
            .policy
            .effective_timeout_secs(self.config.default_timeout.as_secs());
        let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(deadline);

        let mut cancel_poll = tokio::time::interval(self.config.cancel_poll);
        cancel_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut shutdown = self.shutdown.clone();

        let exit = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut deadline => {
                    warn!(
                        subsystem = "executor",
                        job_id = %job.id,
                        timeout_secs,
                        "Trainer exceeded timeout, killing process group"
                    );
                    kill_process_group(&mut child).await;
                    return ExecOutcome::Failed {
                        reason: FailureReason::SubprocessTimeout { timeout_secs },
                        detail: None,
                    };
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(
                            subsystem = "executor",
                            job_id = %job.id,
                            "Shutdown requested, killing process group"
                        );
                        kill_process_group(&mut child).await;
                        return ExecOutcome::Failed {
                            reason: FailureReason::InterruptedByShutdown,
                            detail: None,
                        };
                    }
                }
                _ = cancel_poll.tick() => {
                    match self.ledger.cancel_requested(job.id).await {
                        Ok(true) => {
                            info!(
                                subsystem = "executor",
                                job_id = %job.id,
                                "Operator cancel observed, killing process group"
                            );
                            kill_process_group(&mut child).await;
                            return ExecOutcome::Failed {
                                reason: FailureReason::CancelledByOperator,
                                detail: None,
                            };
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(
                                subsystem = "executor",
                                job_id = %job.id,
                                error = %e,
                                "Cancel poll failed"
                            );
                        }
                    }
                }
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        match exit {
            Ok(status) if status.success() => {
                let mut output = stdout;
                output.push_str(&stderr);
                let metrics = parse_metric_lines(&output);
                info!(
                    subsystem = "executor",
                    job_id = %job.id,
                    branch = %job.branch,
                    metrics = metrics.len(),
                    "Trainer completed"
                );
                ExecOutcome::Completed {
                    metrics,
                    output_dir,
                }
            }
            Ok(status) => {
                let code = status.code();
                let mut output = stdout;
                output.push_str(&stderr);
                ExecOutcome::Failed {
                    reason: FailureReason::SubprocessNonZeroExit { code },
                    detail: Some(output_tail(&output)),
                }
            }
            Err(e) => ExecOutcome::Failed {
                reason: FailureReason::SpawnFailed {
                    message: format!("wait: {e}"),
                },
                detail: None,
            },
        }
    }

    /// Create the run directory, the adapter output directory, and the spec
    /// file the trainer reads.
    fn prepare_run_dir(
        &self,
        job: &TrainingJob,
        run_dir: &std::path::Path,
    ) -> Result<(PathBuf, PathBuf)> {
        let output_dir = run_dir.join(defaults::OUTPUT_DIR_NAME);
        std::fs::create_dir_all(&output_dir)?;

        let lora = &job.policy.lora;
        let output = output_dir.display().to_string();
        let spec = ExecutionSpec {
            dataset_path: &job.dataset_path,
            base_model: &job.policy.base_model,
            lora_r: lora.rank,
            lora_alpha: lora.alpha,
            lora_dropout: lora.dropout,
            learning_rate: lora.learning_rate,
            num_epochs: lora.num_epochs,
            batch_size: lora.batch_size,
            max_length: lora.max_length,
            output_dir: &output,
        };

        let spec_path = run_dir.join(defaults::SPEC_FILE_NAME);
        std::fs::write(&spec_path, serde_json::to_vec_pretty(&spec)?)?;
        Ok((spec_path, output_dir))
    }

    /// Persist the terminal state and, on success, register the artifact.
    async fn finalize(&self, job: &TrainingJob, outcome: ExecOutcome, elapsed: Duration) {
        match outcome {
            ExecOutcome::Completed {
                metrics,
                output_dir,
            } => {
                let update = StatusUpdate::finished_now().with_metrics(metrics.clone());
                if let Err(e) = self
                    .persist_status(job, JobStatus::Completed, update)
                    .await
                {
                    error!(
                        subsystem = "executor",
                        job_id = %job.id,
                        error = %e,
                        "Failed to persist completed job"
                    );
                    return;
                }
                // The job stays Completed even if registration fails; the
                // adapter is on disk and can be registered by hand.
                if let Err(e) = self
                    .registry
                    .register(job, &output_dir, metrics, elapsed.as_secs_f64())
                    .await
                {
                    error!(
                        subsystem = "executor",
                        job_id = %job.id,
                        error = %e,
                        "Failed to register artifact for completed job"
                    );
                }
            }
            ExecOutcome::Failed { reason, detail } => {
                let error_text = match detail {
                    Some(detail) if !detail.is_empty() => format!("{reason}\n{detail}"),
                    _ => reason.to_string(),
                };
                warn!(
                    subsystem = "executor",
                    job_id = %job.id,
                    branch = %job.branch,
                    reason = %reason,
                    "Training job failed"
                );
                let update = StatusUpdate::finished_now().with_error(error_text);
                if let Err(e) = self.persist_status(job, JobStatus::Failed, update).await {
                    error!(
                        subsystem = "executor",
                        job_id = %job.id,
                        error = %e,
                        "Failed to persist failed job"
                    );
                }
            }
        }
    }

    /// Terminal-status writes retry transient ledger errors with
    /// exponential backoff before giving up.
    async fn persist_status(
        &self,
        job: &TrainingJob,
        status: JobStatus,
        update: StatusUpdate,
    ) -> Result<()> {
        let mut delay = Duration::from_millis(defaults::PERSIST_RETRY_BACKOFF_MS);
        let mut attempt = 1;
        loop {
            match self
                .ledger
                .update_status(job.id, status, update.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < defaults::PERSIST_RETRY_MAX => {
                    warn!(
                        subsystem = "executor",
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "Terminal-status write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Read a child stream to the end off the select loop, so pipe buffers
/// never stall the trainer.
fn drain<R>(reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> String {
    match task {
        Some(task) => String::from_utf8_lossy(&task.await.unwrap_or_default()).into_owned(),
        None => String::new(),
    }
}

/// Kill the child's whole process group and reap it.
async fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        } else {
            let _ = child.start_kill();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
    let _ = child.wait().await;
}

fn output_tail(output: &str) -> String {
    let trimmed = output.trim_end();
    if trimmed.len() <= OUTPUT_TAIL_BYTES {
        return trimmed.to_string();
    }
    let start = trimmed.len() - OUTPUT_TAIL_BYTES;
    // Cut on a char boundary.
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(start);
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_tail_short_passthrough() {
        assert_eq!(output_tail("loss: 0.5\n"), "loss: 0.5");
    }

    #[test]
    fn output_tail_keeps_suffix() {
        let long = "x".repeat(OUTPUT_TAIL_BYTES * 2) + "END";
        let tail = output_tail(&long);
        assert_eq!(tail.len(), OUTPUT_TAIL_BYTES);
        assert!(tail.ends_with("END"));
    }

    #[test]
    fn execution_spec_serializes_expected_fields() {
        let spec = ExecutionSpec {
            dataset_path: "/data/math.jsonl",
            base_model: "base-7b",
            lora_r: 16,
            lora_alpha: 32,
            lora_dropout: 0.05,
            learning_rate: 2e-4,
            num_epochs: 3,
            batch_size: 4,
            max_length: 1024,
            output_dir: "/runs/x/adapter",
        };
        let json: serde_json::Value = serde_json::from_slice(&serde_json::to_vec(&spec).unwrap()).unwrap();
        for key in [
            "dataset_path",
            "base_model",
            "lora_r",
            "lora_alpha",
            "lora_dropout",
            "learning_rate",
            "num_epochs",
            "batch_size",
            "max_length",
            "output_dir",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["lora_r"], 16);
        assert_eq!(json["output_dir"], "/runs/x/adapter");
    }
}
