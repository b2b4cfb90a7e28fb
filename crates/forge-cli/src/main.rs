//! branchforge: automatic LoRA fine-tuning scheduler.
//!
//! `run` starts the daemon (eligibility monitor plus worker pool); the
//! other subcommands are one-shot operator actions against the same job
//! ledger.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use forge_core::{
    defaults, ArtifactStore, CancelOutcome, JobFilter, JobLedger, SchedulerConfig,
    TrainingDataSource,
};
use forge_db::Database;
use forge_sched::{
    ArtifactRegistry, EligibilityMonitor, Evaluation, ExecutorConfig, Ineligible, JobExecutor,
    JobScheduler, JsonlDataSource, WorkerPool, WorkerPoolConfig,
};

#[derive(Parser)]
#[command(name = "branchforge")]
#[command(author, version, about = "Automatic LoRA fine-tuning scheduler")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the scheduler configuration file
    #[arg(short, long, default_value = "forge.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon until interrupted
    Run,

    /// Show recent jobs and active adapters
    Status {
        /// Restrict output to one branch
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Evaluate one branch now and schedule it if eligible
    Schedule {
        /// Branch to evaluate
        branch: String,
    },

    /// Cancel a pending or running job
    Cancel {
        /// Job id
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SchedulerConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Status { branch } => status(config, branch).await,
        Commands::Schedule { branch } => schedule(config, &branch).await,
        Commands::Cancel { job_id } => cancel(config, &job_id).await,
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT - "json" or "text" (default: "text")
///   LOG_ANSI   - "true"/"false" override ANSI colors
///   RUST_LOG   - standard env filter (default: "forge_cli=info,forge_sched=info,forge_db=info")
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "forge_cli=info,forge_sched=info,forge_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        let mut layer = tracing_subscriber::fmt::layer();
        if let Some(ansi) = log_ansi {
            layer = layer.with_ansi(ansi);
        }
        registry.with(layer).init();
    }
}

async fn run(config: SchedulerConfig) -> anyhow::Result<()> {
    info!(
        branches = config.branches.len(),
        max_concurrent = config.max_concurrent_jobs,
        poll_secs = config.poll_interval_secs,
        "Starting branchforge scheduler"
    );

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.runs_dir)?;

    let db = Database::connect(&config.database_url).await?;

    // A previous process may have died with jobs still marked Running.
    let recovered = db.jobs.recover_stale_running_jobs().await?;
    if !recovered.is_empty() {
        warn!(
            count = recovered.len(),
            "Recovered stale running jobs from previous process"
        );
    }

    let source: Arc<dyn TrainingDataSource> = Arc::new(JsonlDataSource::new(&config.data_dir));

    let (wake_tx, wake_rx) = tokio::sync::mpsc::channel(defaults::WAKE_CHANNEL_CAPACITY);
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

    let scheduler = JobScheduler::new(db.jobs.clone(), source.clone(), wake_tx);

    let executor = Arc::new(JobExecutor::new(
        db.jobs.clone(),
        ArtifactRegistry::new(db.artifacts.clone()),
        ExecutorConfig::from_scheduler_config(&config),
        cancel_rx,
    ));

    let pool = WorkerPool::new(
        db.jobs.clone(),
        executor,
        WorkerPoolConfig {
            max_concurrent_jobs: config.max_concurrent_jobs,
            sweep_interval: Duration::from_secs(defaults::SWEEP_INTERVAL_SECS),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        },
        wake_rx,
        cancel_tx,
    );

    let monitor = EligibilityMonitor::new(
        db.jobs.clone(),
        source,
        scheduler,
        config.branches.clone(),
        Duration::from_secs(config.poll_interval_secs),
    );

    let pool_handle = pool.start();
    let monitor_handle = monitor.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Stop scheduling new work before draining the pool.
    monitor_handle.shutdown().await;
    pool_handle.shutdown().await;

    info!("Scheduler stopped");
    Ok(())
}

async fn status(config: SchedulerConfig, branch: Option<String>) -> anyhow::Result<()> {
    let db = Database::connect(&config.database_url).await?;

    let filter = JobFilter {
        branch: branch.clone(),
        status: None,
        limit: Some(defaults::STATUS_JOB_LIMIT),
    };
    let jobs = db.jobs.list_jobs(&filter).await?;

    let running = db.jobs.running_count().await?;
    println!("Running jobs: {running}");
    println!();

    if jobs.is_empty() {
        println!("No jobs recorded.");
    } else {
        println!(
            "{:<36}  {:<14} {:<9} {:>6}  {:<20}  {}",
            "JOB", "BRANCH", "STATUS", "POINTS", "CREATED", "DETAIL"
        );
        for job in &jobs {
            let detail = match (&job.error, job.metrics.get("final_loss")) {
                (Some(error), _) => error.lines().next().unwrap_or("").to_string(),
                (None, Some(loss)) => format!("final_loss: {loss}"),
                (None, None) => String::new(),
            };
            println!(
                "{:<36}  {:<14} {:<9} {:>6}  {:<20}  {}",
                job.id,
                job.branch,
                job.status,
                job.data_points,
                job.created_at.format("%Y-%m-%d %H:%M:%S"),
                detail
            );
        }
    }

    println!();
    println!("Active adapters:");
    let branches: Vec<&str> = match &branch {
        Some(b) => vec![b.as_str()],
        None => config.branches.iter().map(|p| p.branch.as_str()).collect(),
    };
    for name in branches {
        match db.artifacts.get_active_artifact(name).await? {
            Some(artifact) => println!(
                "  {:<14} {}  ({:.0}s, {})",
                artifact.branch,
                artifact.path,
                artifact.duration_secs,
                artifact.created_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("  {:<14} (none)", name),
        }
    }
    Ok(())
}

async fn schedule(config: SchedulerConfig, branch: &str) -> anyhow::Result<()> {
    let db = Database::connect(&config.database_url).await?;
    let source: Arc<dyn TrainingDataSource> = Arc::new(JsonlDataSource::new(&config.data_dir));

    // No pool is attached here; a running daemon picks the job up on its
    // next sweep.
    let (wake_tx, _wake_rx) = tokio::sync::mpsc::channel(defaults::WAKE_CHANNEL_CAPACITY);
    let scheduler = JobScheduler::new(db.jobs.clone(), source.clone(), wake_tx);
    let monitor = EligibilityMonitor::new(
        db.jobs.clone(),
        source,
        scheduler,
        config.branches.clone(),
        Duration::from_secs(config.poll_interval_secs),
    );

    match monitor.check_branch(branch).await? {
        Evaluation::Scheduled(job) => {
            println!("Scheduled job {} for branch {}", job.id, job.branch);
            println!("  dataset: {} ({} data points)", job.dataset_path, job.data_points);
        }
        Evaluation::Skipped(Ineligible::ActiveJobExists) => {
            println!("Branch {branch} already has a pending or running job.");
        }
        Evaluation::Skipped(Ineligible::CoolingDown { remaining_secs }) => {
            println!("Branch {branch} is cooling down ({remaining_secs}s remaining).");
        }
        Evaluation::Skipped(Ineligible::NotEnoughData { have, need }) => {
            println!("Branch {branch} has {have} unconsumed data points, needs {need}.");
        }
    }
    Ok(())
}

async fn cancel(config: SchedulerConfig, job_id: &str) -> anyhow::Result<()> {
    let id = Uuid::parse_str(job_id)?;
    let db = Database::connect(&config.database_url).await?;

    match db.jobs.request_cancel(id).await? {
        CancelOutcome::CancelledPending => {
            println!("Job {id} cancelled.");
        }
        CancelOutcome::CancelRequested => {
            println!("Job {id} is running; cancellation requested.");
        }
        CancelOutcome::AlreadyTerminal(status) => {
            println!("Job {id} already finished ({status}).");
        }
    }
    Ok(())
}
