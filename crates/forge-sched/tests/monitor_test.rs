//! Eligibility monitor integration tests against a real ledger and a mock
//! data source.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use forge_core::{
    defaults, BranchPolicy, Error, JobLedger, JobStatus, LoraHyperparams, Result, StatusUpdate,
    TrainingDataSource,
};
use forge_db::Database;
use forge_sched::{EligibilityMonitor, Evaluation, Ineligible, JobScheduler};

/// In-memory data source with scriptable counts and failures.
struct MockDataSource {
    counts: Mutex<HashMap<String, u64>>,
    failing: Mutex<Vec<String>>,
    last_export_cap: Mutex<Option<u64>>,
}

impl MockDataSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(HashMap::new()),
            failing: Mutex::new(Vec::new()),
            last_export_cap: Mutex::new(None),
        })
    }

    fn set_count(&self, branch: &str, count: u64) {
        self.counts.lock().unwrap().insert(branch.to_string(), count);
    }

    fn fail_branch(&self, branch: &str) {
        self.failing.lock().unwrap().push(branch.to_string());
    }

    fn last_export_cap(&self) -> Option<u64> {
        *self.last_export_cap.lock().unwrap()
    }
}

#[async_trait]
impl TrainingDataSource for MockDataSource {
    async fn count_unconsumed(&self, branch: &str) -> Result<u64> {
        if self.failing.lock().unwrap().iter().any(|b| b == branch) {
            return Err(Error::DatasetUnavailable {
                branch: branch.to_string(),
                message: "mock failure".to_string(),
            });
        }
        Ok(*self.counts.lock().unwrap().get(branch).unwrap_or(&0))
    }

    async fn export_snapshot(&self, branch: &str, cap: u64) -> Result<PathBuf> {
        *self.last_export_cap.lock().unwrap() = Some(cap);
        let mut counts = self.counts.lock().unwrap();
        let available = counts.get(branch).copied().unwrap_or(0);
        if available == 0 {
            return Err(Error::DatasetUnavailable {
                branch: branch.to_string(),
                message: "no unconsumed data points".to_string(),
            });
        }
        counts.insert(branch.to_string(), available.saturating_sub(cap));
        Ok(PathBuf::from(format!("/snapshots/{branch}.jsonl")))
    }
}

struct Harness {
    db: Database,
    source: Arc<MockDataSource>,
    monitor: EligibilityMonitor,
    _wake_rx: mpsc::Receiver<()>,
    _dir: tempfile::TempDir,
}

async fn harness(policies: Vec<BranchPolicy>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let db = Database::connect(&url).await.unwrap();

    let source = MockDataSource::new();
    let (wake_tx, wake_rx) = mpsc::channel(defaults::WAKE_CHANNEL_CAPACITY);
    let scheduler = JobScheduler::new(
        db.jobs.clone(),
        source.clone() as Arc<dyn TrainingDataSource>,
        wake_tx,
    );
    let monitor = EligibilityMonitor::new(
        db.jobs.clone(),
        source.clone() as Arc<dyn TrainingDataSource>,
        scheduler,
        policies,
        Duration::from_secs(300),
    );

    Harness {
        db,
        source,
        monitor,
        _wake_rx: wake_rx,
        _dir: dir,
    }
}

fn policy(branch: &str) -> BranchPolicy {
    BranchPolicy {
        branch: branch.to_string(),
        base_model: "base-7b".to_string(),
        lora: LoraHyperparams::default(),
        min_data_points: 30,
        max_data_points: 500,
        cooldown_secs: 3600,
        timeout_secs: None,
    }
}

#[tokio::test]
async fn schedules_when_threshold_reached() {
    let h = harness(vec![policy("math")]).await;
    h.source.set_count("math", 30);

    let eval = h.monitor.evaluate(&policy("math")).await.unwrap();
    let job = match eval {
        Evaluation::Scheduled(job) => job,
        other => panic!("expected scheduled, got {other:?}"),
    };
    assert_eq!(job.branch, "math");
    assert_eq!(job.data_points, 30);
    assert_eq!(job.dataset_path, "/snapshots/math.jsonl");

    let stored = h.db.jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
}

#[tokio::test]
async fn below_threshold_is_skipped() {
    let h = harness(vec![policy("math")]).await;
    h.source.set_count("math", 29);

    let eval = h.monitor.evaluate(&policy("math")).await.unwrap();
    assert!(matches!(
        eval,
        Evaluation::Skipped(Ineligible::NotEnoughData { have: 29, need: 30 })
    ));
    assert!(h.db.jobs.active_job_for_branch("math").await.unwrap().is_none());
}

#[tokio::test]
async fn active_job_blocks_rescheduling() {
    let h = harness(vec![policy("math")]).await;
    h.source.set_count("math", 100);

    let first = h.monitor.evaluate(&policy("math")).await.unwrap();
    assert!(matches!(first, Evaluation::Scheduled(_)));

    // More data arrives while the job is still pending.
    h.source.set_count("math", 100);
    let second = h.monitor.evaluate(&policy("math")).await.unwrap();
    assert!(matches!(
        second,
        Evaluation::Skipped(Ineligible::ActiveJobExists)
    ));

    let jobs = h
        .db
        .jobs
        .list_jobs(&forge_core::JobFilter::default())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn cooldown_blocks_rescheduling() {
    let h = harness(vec![policy("math")]).await;
    h.source.set_count("math", 100);

    // Drive one job to completion so a recent terminal finish exists.
    let eval = h.monitor.evaluate(&policy("math")).await.unwrap();
    assert!(matches!(eval, Evaluation::Scheduled(_)));
    let claimed = h.db.jobs.claim_next_pending().await.unwrap().unwrap();
    h.db.jobs
        .update_status(claimed.id, JobStatus::Completed, StatusUpdate::finished_now())
        .await
        .unwrap();

    h.source.set_count("math", 100);
    let eval = h.monitor.evaluate(&policy("math")).await.unwrap();
    match eval {
        Evaluation::Skipped(Ineligible::CoolingDown { remaining_secs }) => {
            assert!(remaining_secs > 0 && remaining_secs <= 3600);
        }
        other => panic!("expected cooldown, got {other:?}"),
    }

    // A zero-cooldown policy schedules immediately after the same finish.
    let mut eager = policy("math");
    eager.cooldown_secs = 0;
    let eval = h.monitor.evaluate(&eager).await.unwrap();
    assert!(matches!(eval, Evaluation::Scheduled(_)));
}

#[tokio::test]
async fn data_hint_is_capped_at_policy_maximum() {
    let h = harness(vec![policy("math")]).await;
    h.source.set_count("math", 10_000);

    let eval = h.monitor.evaluate(&policy("math")).await.unwrap();
    let job = match eval {
        Evaluation::Scheduled(job) => job,
        other => panic!("expected scheduled, got {other:?}"),
    };
    assert_eq!(job.data_points, 500);
    assert_eq!(h.source.last_export_cap(), Some(500));
}

#[tokio::test]
async fn failing_branch_does_not_block_others() {
    let h = harness(vec![policy("math"), policy("chemistry")]).await;
    h.source.fail_branch("math");
    h.source.set_count("chemistry", 50);

    h.monitor.tick().await;

    assert!(h.db.jobs.active_job_for_branch("math").await.unwrap().is_none());
    let chem = h
        .db
        .jobs
        .active_job_for_branch("chemistry")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chem.status, JobStatus::Pending);
}

#[tokio::test]
async fn check_branch_requires_a_policy() {
    let h = harness(vec![policy("math")]).await;

    let err = h.monitor.check_branch("geology").await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    h.source.set_count("math", 30);
    let eval = h.monitor.check_branch("math").await.unwrap();
    assert!(matches!(eval, Evaluation::Scheduled(_)));
}

#[tokio::test]
async fn started_monitor_evaluates_immediately() {
    let h = harness(vec![policy("math")]).await;
    h.source.set_count("math", 30);

    let db = h.db.clone();
    let handle = h.monitor.start();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if db.jobs.active_job_for_branch("math").await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    handle.shutdown().await;
}
