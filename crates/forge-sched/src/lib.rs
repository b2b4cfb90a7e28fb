//! # forge-sched
//!
//! Scheduling runtime for branchforge: the eligibility monitor decides
//! when a branch is due for training, the scheduler snapshots its dataset
//! and records a Pending job, and the worker pool claims jobs and runs the
//! external trainer through the executor. Completed adapters land in the
//! artifact registry.
//!
//! All coordination goes through the [`forge_core::JobLedger`]; the
//! components hold no shared in-memory state and can be restarted
//! independently.

pub mod datasource;
pub mod executor;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use datasource::JsonlDataSource;
pub use executor::{ExecutorConfig, JobExecutor};
pub use monitor::{EligibilityMonitor, Evaluation, Ineligible, MonitorHandle};
pub use registry::ArtifactRegistry;
pub use scheduler::JobScheduler;
pub use worker::{PoolEvent, PoolHandle, WorkerPool, WorkerPoolConfig};
