//! Core data model: jobs, policies, artifacts, and the job state machine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults;

/// Lifecycle status of a training job.
///
/// Legal transitions: `Pending -> Running -> {Completed, Failed}` and
/// `Pending -> Cancelled`. Completed, Failed and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Stable string form used in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the ledger string form.
    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the job still occupies the branch (blocks new scheduling).
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether `self -> next` is a legal state-machine transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended in `Failed`. Rendered with a stable prefix into the
/// ledger's `error` column so the `status` command can surface it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The trainer exceeded its hard wall-clock timeout.
    SubprocessTimeout { timeout_secs: u64 },
    /// The trainer exited with a non-zero code (None if killed by signal).
    SubprocessNonZeroExit { code: Option<i32> },
    /// Graceful shutdown cancelled the job.
    InterruptedByShutdown,
    /// A previous process crashed while the job was Running; the child is
    /// no longer tracked and cannot be resumed.
    InterruptedByRestart,
    /// An operator cancelled the running job.
    CancelledByOperator,
    /// The trainer process could not be started.
    SpawnFailed { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::SubprocessTimeout { timeout_secs } => {
                write!(f, "subprocess_timeout: exceeded {}s", timeout_secs)
            }
            FailureReason::SubprocessNonZeroExit { code: Some(code) } => {
                write!(f, "subprocess_non_zero_exit: exit code {}", code)
            }
            FailureReason::SubprocessNonZeroExit { code: None } => {
                write!(f, "subprocess_non_zero_exit: killed by signal")
            }
            FailureReason::InterruptedByShutdown => {
                write!(f, "interrupted_by_shutdown: scheduler stopped")
            }
            FailureReason::InterruptedByRestart => {
                write!(f, "interrupted_by_restart: found running after restart")
            }
            FailureReason::CancelledByOperator => {
                write!(f, "cancelled_by_operator: cancel requested")
            }
            FailureReason::SpawnFailed { message } => {
                write!(f, "spawn_failed: {}", message)
            }
        }
    }
}

/// LoRA hyperparameters carried by a branch policy and snapshotted into
/// each job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraHyperparams {
    #[serde(default = "default_rank")]
    pub rank: u32,
    #[serde(default = "default_alpha")]
    pub alpha: u32,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_length")]
    pub max_length: u32,
}

fn default_rank() -> u32 {
    defaults::LORA_RANK
}
fn default_alpha() -> u32 {
    defaults::LORA_ALPHA
}
fn default_dropout() -> f64 {
    defaults::LORA_DROPOUT
}
fn default_learning_rate() -> f64 {
    defaults::LEARNING_RATE
}
fn default_num_epochs() -> u32 {
    defaults::NUM_EPOCHS
}
fn default_batch_size() -> u32 {
    defaults::BATCH_SIZE
}
fn default_max_length() -> u32 {
    defaults::MAX_LENGTH
}

impl Default for LoraHyperparams {
    fn default() -> Self {
        Self {
            rank: defaults::LORA_RANK,
            alpha: defaults::LORA_ALPHA,
            dropout: defaults::LORA_DROPOUT,
            learning_rate: defaults::LEARNING_RATE,
            num_epochs: defaults::NUM_EPOCHS,
            batch_size: defaults::BATCH_SIZE,
            max_length: defaults::MAX_LENGTH,
        }
    }
}

/// Per-branch training policy. Immutable once loaded for a run; each job
/// carries its own snapshot so later edits never change in-flight jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchPolicy {
    /// Branch identifier, e.g. "mathematics".
    pub branch: String,
    /// Base model reference the adapter is trained against.
    pub base_model: String,
    /// LoRA hyperparameters.
    #[serde(default)]
    pub lora: LoraHyperparams,
    /// Minimum accumulated data points before a job is scheduled.
    pub min_data_points: u64,
    /// Cap on data points consumed by a single training run.
    pub max_data_points: u64,
    /// Minimum seconds between terminal jobs for this branch.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Per-branch timeout override; falls back to the global default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_cooldown_secs() -> u64 {
    defaults::COOLDOWN_SECS
}

impl BranchPolicy {
    /// Effective hard timeout for jobs under this policy.
    pub fn effective_timeout_secs(&self, global_default: u64) -> u64 {
        self.timeout_secs.unwrap_or(global_default)
    }
}

/// One training job attempt. Never deleted; the ledger is an append/update
/// log, not a queue that drops entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: Uuid,
    pub branch: String,
    /// Dataset snapshot path produced by the exporter at scheduling time.
    pub dataset_path: String,
    /// Policy snapshot taken at creation; never changes afterwards.
    pub policy: BranchPolicy,
    pub status: JobStatus,
    /// Data-count hint the job was scheduled with (already capped).
    pub data_points: i64,
    /// Set by the ledger when an operator cancels a running job.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Populated only on success.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Populated only on failure.
    pub error: Option<String>,
}

impl TrainingJob {
    /// Build a new Pending job with a time-ordered id and a policy snapshot.
    pub fn new(policy: BranchPolicy, dataset_path: String, data_points: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            branch: policy.branch.clone(),
            dataset_path,
            policy,
            status: JobStatus::Pending,
            data_points: data_points as i64,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            metrics: BTreeMap::new(),
            error: None,
        }
    }
}

/// The output of a successful training job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedArtifact {
    pub id: Uuid,
    pub branch: String,
    pub job_id: Uuid,
    /// Path to the trained adapter directory.
    pub path: String,
    pub metrics: BTreeMap<String, f64>,
    pub duration_secs: f64,
    pub created_at: DateTime<Utc>,
    /// Exactly one artifact per branch is active at a time.
    pub active: bool,
}

/// Field updates applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: Option<BTreeMap<String, f64>>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn finished_now() -> Self {
        Self {
            finished_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn with_metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Filter for ledger job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub branch: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
}

/// Outcome of an operator cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still Pending and is now Cancelled.
    CancelledPending,
    /// The job is Running; cancellation was flagged and the executor will
    /// observe it shortly.
    CancelRequested,
    /// The job already reached a terminal state; nothing to do.
    AlreadyTerminal(JobStatus),
}
