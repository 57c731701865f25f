#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Scheduler, store and worker runner working together on one workspace.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use foreman_core::{FailureDetail, ForemanResult, ReasonCode};
use foreman_minion::{
    JobOutcome, Launcher, MinionConfig, MinionRecord, MinionRunner, MinionSpec, MinionStatus,
    MinionStore, PipelineJob, Recurrence, Scheduler,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl Launcher for RecordingLauncher {
    async fn launch(&self, record: &MinionRecord, fire_seq: u64) -> ForemanResult<()> {
        self.launched.lock().push((record.id.clone(), fire_seq));
        Ok(())
    }
}

struct FixedJob {
    succeed: bool,
    runs: AtomicUsize,
}

impl FixedJob {
    fn new(succeed: bool) -> Self {
        Self {
            succeed,
            runs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PipelineJob for FixedJob {
    async fn execute(&self, task: &str, _cancel: CancellationToken) -> JobOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            JobOutcome::success(format!("did {task}"))
        } else {
            JobOutcome::failed(FailureDetail::new(ReasonCode::StepExecutionFailed, "fetch failed"))
        }
    }
}

/// Runs until cancelled.
#[derive(Default)]
struct BlockingJob {
    cancelled: AtomicBool,
}

#[async_trait]
impl PipelineJob for BlockingJob {
    async fn execute(&self, _task: &str, cancel: CancellationToken) -> JobOutcome {
        cancel.cancelled().await;
        self.cancelled.store(true, Ordering::SeqCst);
        JobOutcome::failed(FailureDetail::new(ReasonCode::Cancelled, "cancelled"))
    }
}

fn config() -> MinionConfig {
    MinionConfig {
        liveness_timeout_secs: 60,
        heartbeat_ms: 20,
        ..MinionConfig::default()
    }
}

struct Fixture {
    _tmp: TempDir,
    store: Arc<MinionStore>,
    launcher: Arc<RecordingLauncher>,
    scheduler: Scheduler,
    runner: MinionRunner,
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MinionStore::new(tmp.path().join("minions")).await.unwrap());
    let launcher = Arc::new(RecordingLauncher::default());
    let scheduler = Scheduler::new(store.clone(), launcher.clone(), config());
    let runner = MinionRunner::new(store.clone(), config());
    Fixture {
        _tmp: tmp,
        store,
        launcher,
        scheduler,
        runner,
    }
}

#[tokio::test]
async fn interval_minion_completes_after_max_runs() {
    let f = fixture().await;
    let m = f
        .store
        .create(
            MinionSpec::new("summarize the inbox")
                .every(Recurrence::interval("5m").unwrap())
                .max_runs(3),
        )
        .await
        .unwrap();
    let job = FixedJob::new(true);

    for round in 0..3 {
        let now = Utc::now() + Duration::minutes(6 * round);
        let report = f.scheduler.poll_once(now).await.unwrap();
        assert_eq!(report.fired.len(), 1, "round {round}");
        let (id, seq) = report.fired[0].clone();
        let after = f.runner.run(&id, seq, &job).await.unwrap();
        let expected = if round < 2 { MinionStatus::Pending } else { MinionStatus::Completed };
        assert_eq!(after.status, expected);
    }

    let later = Utc::now() + Duration::minutes(60);
    let report = f.scheduler.poll_once(later).await.unwrap();
    assert!(report.fired.is_empty());

    let record = f.store.get(&m.id).await.unwrap();
    assert_eq!(record.status, MinionStatus::Completed);
    assert_eq!(record.run_count, 3);
    assert!(record.next_run.is_none());
    assert_eq!(job.runs.load(Ordering::SeqCst), 3);

    let transcript = f.store.transcript(&m.id).await.unwrap();
    assert_eq!(transcript.iter().filter(|e| e.event == "succeeded").count(), 3);
}

#[tokio::test]
async fn failed_runs_keep_the_schedule() {
    let f = fixture().await;
    let m = f
        .store
        .create(MinionSpec::new("flaky sync").every(Recurrence::interval("1h").unwrap()))
        .await
        .unwrap();
    let report = f.scheduler.poll_once(Utc::now()).await.unwrap();
    let (id, seq) = report.fired[0].clone();
    let after = f.runner.run(&id, seq, &FixedJob::new(false)).await.unwrap();

    assert_eq!(after.status, MinionStatus::Pending);
    assert_eq!(after.run_count, 1);
    assert_eq!(after.last_error.unwrap().code, ReasonCode::StepExecutionFailed);
    assert!(after.next_run.unwrap() > Utc::now() + Duration::minutes(59));
    assert_eq!(f.store.get(&m.id).await.unwrap().last_run.unwrap().succeeded, Some(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_schedulers_fire_each_minion_once() {
    let f = fixture().await;
    let mut ids = Vec::new();
    for i in 0..5 {
        let m = f.store.create(MinionSpec::new(format!("job {i}"))).await.unwrap();
        ids.push(m.id);
    }

    let now = Utc::now();
    let mut handles = Vec::new();
    for _ in 0..8 {
        // Each poller gets its own store handle, as separate processes would.
        let store = Arc::new(MinionStore::new(f.store.root()).await.unwrap());
        let scheduler = Scheduler::new(store, f.launcher.clone(), config());
        handles.push(tokio::spawn(async move { scheduler.poll_once(now).await.unwrap() }));
    }
    let mut fired = 0;
    for handle in handles {
        fired += handle.await.unwrap().fired.len();
    }

    assert_eq!(fired, ids.len());
    let launched = f.launcher.launched.lock().clone();
    assert_eq!(launched.len(), ids.len());
    for id in &ids {
        assert_eq!(launched.iter().filter(|(l, _)| l == id).count(), 1);
        let record = f.store.get(id).await.unwrap();
        assert_eq!(record.status, MinionStatus::Running);
        assert_eq!(record.fire_seq, 1);
    }
}

#[tokio::test]
async fn killed_minion_never_becomes_pending_again() {
    let f = fixture().await;
    let m = f
        .store
        .create(MinionSpec::new("watch prices").every(Recurrence::interval("5m").unwrap()))
        .await
        .unwrap();
    let killed = f.store.kill(&m.id).await.unwrap();
    assert_eq!(killed.status, MinionStatus::Killed);
    assert!(killed.schedule.is_none());

    for hours in [0, 1, 24] {
        let report = f.scheduler.poll_once(Utc::now() + Duration::hours(hours)).await.unwrap();
        assert!(report.fired.is_empty());
    }
    let record = f.store.get(&m.id).await.unwrap();
    assert_eq!(record.status, MinionStatus::Killed);
    assert!(record.next_run.is_none());
    assert_eq!(f.store.kill(&m.id).await.unwrap().version, killed.version);
}

#[tokio::test]
async fn kill_during_a_run_cancels_the_job() {
    let f = fixture().await;
    let m = f
        .store
        .create(MinionSpec::new("long crawl").every(Recurrence::interval("5m").unwrap()))
        .await
        .unwrap();
    let (id, seq) = f.scheduler.poll_once(Utc::now()).await.unwrap().fired[0].clone();

    let job = Arc::new(BlockingJob::default());
    let runner = MinionRunner::new(f.store.clone(), config());
    let worker = {
        let job = job.clone();
        tokio::spawn(async move { runner.run(&id, seq, job.as_ref()).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    f.store.kill(&m.id).await.unwrap();

    let finished = tokio::time::timeout(std::time::Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(job.cancelled.load(Ordering::SeqCst));
    assert_eq!(finished.status, MinionStatus::Killed);
    assert!(finished.schedule.is_none());
}

#[tokio::test]
async fn purge_during_a_run_cancels_the_job() {
    let f = fixture().await;
    let m = f
        .store
        .create(MinionSpec::new("long crawl").every(Recurrence::interval("5m").unwrap()))
        .await
        .unwrap();
    let (id, seq) = f.scheduler.poll_once(Utc::now()).await.unwrap().fired[0].clone();

    let job = Arc::new(BlockingJob::default());
    let runner = MinionRunner::new(f.store.clone(), config());
    let worker = {
        let job = job.clone();
        tokio::spawn(async move { runner.run(&id, seq, job.as_ref()).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    f.store.purge(&m.id).await.unwrap();

    let finished = tokio::time::timeout(std::time::Duration::from_secs(3), worker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(job.cancelled.load(Ordering::SeqCst));
    assert_eq!(finished.status, MinionStatus::Killed);
    assert!(!f.store.minion_dir(&m.id).exists());
    assert!(f.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn silent_worker_is_failed_by_liveness_check() {
    let f = fixture().await;
    let once = f.store.create(MinionSpec::new("one shot")).await.unwrap();
    let recurring = f
        .store
        .create(MinionSpec::new("recurring").every(Recurrence::interval("10m").unwrap()))
        .await
        .unwrap();

    let now = Utc::now();
    assert_eq!(f.scheduler.poll_once(now).await.unwrap().fired.len(), 2);
    let quiet = f.scheduler.poll_once(now + Duration::seconds(30)).await.unwrap();
    assert!(quiet.expired.is_empty());

    let report = f.scheduler.poll_once(now + Duration::seconds(61)).await.unwrap();
    assert_eq!(report.expired.len(), 2);

    let once = f.store.get(&once.id).await.unwrap();
    assert_eq!(once.status, MinionStatus::Failed);
    assert_eq!(once.last_error.unwrap().code, ReasonCode::MinionLivenessTimeout);

    let recurring = f.store.get(&recurring.id).await.unwrap();
    assert_eq!(recurring.status, MinionStatus::Pending);
    assert_eq!(recurring.run_count, 1);
}

#[tokio::test]
async fn pending_minion_past_its_window_is_retired() {
    let f = fixture().await;
    let now = Utc::now();
    let m = f
        .store
        .create(
            MinionSpec::new("short campaign")
                .every(Recurrence::interval("1h").unwrap())
                .window(Some(now + Duration::hours(1)), Some(now + Duration::hours(2))),
        )
        .await
        .unwrap();

    let report = f.scheduler.poll_once(now + Duration::hours(3)).await.unwrap();
    assert!(report.fired.is_empty());
    assert_eq!(report.retired, vec![m.id.clone()]);
    assert_eq!(f.store.get(&m.id).await.unwrap().status, MinionStatus::Completed);
}
