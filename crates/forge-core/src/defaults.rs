//! Centralized default constants for branchforge.
//!
//! **This module is the single source of truth** for shared default values.
//! All crates reference these constants instead of defining their own magic
//! numbers.

// =============================================================================
// SCHEDULING
// =============================================================================

/// Default maximum number of concurrently running training jobs.
pub const MAX_CONCURRENT_JOBS: usize = 2;

/// Default eligibility poll interval in seconds (5 minutes).
pub const POLL_INTERVAL_SECS: u64 = 300;

/// Default minimum wait between terminal jobs for the same branch (1 hour).
pub const COOLDOWN_SECS: u64 = 3600;

/// Worker pool sweep interval for pending jobs in seconds. The sweep is the
/// reliable dispatch path; wake signals only improve latency.
pub const SWEEP_INTERVAL_SECS: u64 = 10;

/// Capacity of the best-effort wake channel between scheduler and pool.
pub const WAKE_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// EXECUTION
// =============================================================================

/// Default hard wall-clock timeout for one training job in seconds (1 hour).
pub const JOB_TIMEOUT_SECS: u64 = 3600;

/// How often a running executor polls the ledger for an operator cancel
/// request, in seconds.
pub const CANCEL_POLL_SECS: u64 = 2;

/// Grace period for in-flight executors on shutdown, in seconds.
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

/// Name of the execution spec file written into each job's run directory.
pub const SPEC_FILE_NAME: &str = "spec.json";

/// Name of the trained-adapter output directory inside a run directory.
pub const OUTPUT_DIR_NAME: &str = "adapter";

// =============================================================================
// PERSISTENCE RETRY
// =============================================================================

/// Maximum attempts for a terminal-status ledger write.
pub const PERSIST_RETRY_MAX: u32 = 3;

/// Initial backoff between persistence retries in milliseconds (doubles
/// per attempt).
pub const PERSIST_RETRY_BACKOFF_MS: u64 = 200;

// =============================================================================
// LORA HYPERPARAMETERS
// =============================================================================

/// Default LoRA rank.
pub const LORA_RANK: u32 = 16;

/// Default LoRA alpha.
pub const LORA_ALPHA: u32 = 32;

/// Default LoRA dropout.
pub const LORA_DROPOUT: f64 = 0.05;

/// Default learning rate.
pub const LEARNING_RATE: f64 = 2e-4;

/// Default number of training epochs.
pub const NUM_EPOCHS: u32 = 3;

/// Default training batch size.
pub const BATCH_SIZE: u32 = 4;

/// Default maximum sequence length.
pub const MAX_LENGTH: u32 = 1024;

// =============================================================================
// OPERATOR SURFACE
// =============================================================================

/// Default number of jobs shown by the `status` command.
pub const STATUS_JOB_LIMIT: i64 = 20;
