//! # forge-core
//!
//! Core types, traits, and configuration for branchforge, the automatic
//! LoRA fine-tuning job scheduler.
//!
//! This crate defines the data model (branch policies, training jobs,
//! trained artifacts, the job state machine), the trait seams to the job
//! ledger and the training data source, the error taxonomy, and the shared
//! default constants. It performs no I/O beyond reading the configuration
//! file.

pub mod config;
pub mod defaults;
pub mod error;
pub mod metrics;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use metrics::parse_metric_lines;
pub use models::{
    BranchPolicy, CancelOutcome, FailureReason, JobFilter, JobStatus, LoraHyperparams,
    StatusUpdate, TrainedArtifact, TrainingJob,
};
pub use traits::{ArtifactStore, JobLedger, TrainingDataSource};
