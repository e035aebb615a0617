use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uberbackup::context::ChildRegistry;
use uberbackup::core::transfer_engine::{
    SimulatedEngine, TransferEngine, TransferExit, TransferRequest,
};
use uberbackup::core::{
    JobSpec, ReachabilityProbe, Rotator, Scheduler, SchedulerOptions, SnapshotStore, StaticProbe,
    TransferRunner, Worker, today_label,
};

/// Records the order in which jobs reach the transfer step.
#[derive(Default)]
struct RecordingEngine {
    order: Arc<Mutex<Vec<String>>>,
}

impl TransferEngine for RecordingEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
        _children: &ChildRegistry,
    ) -> Pin<Box<dyn Future<Output = Result<TransferExit>> + Send>> {
        let order = self.order.clone();
        let req = req.clone();
        Box::pin(async move {
            order.lock().unwrap().push(req.job.clone());
            tokio::fs::create_dir_all(&req.destination).await?;
            Ok(TransferExit::code(0))
        })
    }
}

/// Host that never answers; counts how often it was asked.
#[derive(Default)]
struct DeadHost {
    probes: AtomicUsize,
}

#[async_trait]
impl ReachabilityProbe for DeadHost {
    async fn is_reachable(&self, _host: &str, _children: &ChildRegistry) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        false
    }
}

fn spec(name: &str, enabled: bool) -> JobSpec {
    JobSpec {
        name: name.into(),
        host: format!("{name}.example"),
        remote_path: "/".into(),
        enabled,
        include: vec![],
        exclude: vec![],
    }
}

fn options(max_jobs: usize) -> SchedulerOptions {
    SchedulerOptions {
        max_jobs,
        poll_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(5),
    }
}

fn scheduler(
    data: &Path,
    specs: Vec<JobSpec>,
    engine: Arc<dyn TransferEngine>,
    shutdown: CancellationToken,
    max_jobs: usize,
) -> Scheduler {
    scheduler_with(
        data,
        specs,
        engine,
        Arc::new(StaticProbe(true)),
        shutdown,
        options(max_jobs),
    )
}

fn scheduler_with(
    data: &Path,
    specs: Vec<JobSpec>,
    engine: Arc<dyn TransferEngine>,
    probe: Arc<dyn ReachabilityProbe>,
    shutdown: CancellationToken,
    options: SchedulerOptions,
) -> Scheduler {
    let store = SnapshotStore::new(data);
    let runner = TransferRunner::new(
        store.clone(),
        engine,
        probe,
        ChildRegistry::new(),
        shutdown.clone(),
    );
    let worker = Worker::new(Rotator::new(store.clone(), 5), runner, Vec::new());
    Scheduler::new(specs, store, Arc::new(worker), shutdown, options)
}

async fn wait_for_calls(calls: impl Fn() -> usize, n: usize) {
    timeout(Duration::from_secs(5), async {
        while calls() < n {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transfers should start");
}

async fn wait_for_snapshots(store: &SnapshotStore, jobs: &[&str]) {
    timeout(Duration::from_secs(10), async {
        while !jobs.iter().all(|job| store.has_today_label(job)) {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("jobs should all finish");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bounded_by_max_jobs() {
    let temp = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let engine = SimulatedEngine::new(Duration::from_millis(200));
    let stats = engine.stats();

    let names = ["j1", "j2", "j3", "j4"];
    let specs = names.iter().map(|n| spec(n, true)).collect();
    let scheduler = scheduler(temp.path(), specs, Arc::new(engine), shutdown.clone(), 2);
    let handle = tokio::spawn(scheduler.run());

    let store = SnapshotStore::new(temp.path());
    wait_for_snapshots(&store, &names).await;
    shutdown.cancel();
    let remaining = handle.await.unwrap();

    assert!(remaining.is_empty());
    assert_eq!(stats.calls(), 4);
    assert_eq!(stats.peak_concurrency(), 2);
    for name in names {
        assert!(!store.has_staging(name));
    }
}

#[tokio::test]
async fn test_oldest_snapshot_runs_first_and_disabled_never_runs() {
    let temp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(temp.path());
    std::fs::create_dir_all(store.snapshot_dir("alpha", "2024-05-03")).unwrap();
    std::fs::create_dir_all(store.snapshot_dir("gamma", "2024-05-01")).unwrap();

    let engine = RecordingEngine::default();
    let order = engine.order.clone();
    let shutdown = CancellationToken::new();
    let specs = vec![
        spec("alpha", true),
        spec("beta", true),
        spec("gamma", true),
        spec("off", false),
    ];
    let scheduler = scheduler(temp.path(), specs, Arc::new(engine), shutdown.clone(), 1);

    let initial: Vec<&str> = scheduler.jobs().iter().map(|j| j.name()).collect();
    assert_eq!(initial, vec!["beta", "off", "gamma", "alpha"]);

    let handle = tokio::spawn(scheduler.run());
    wait_for_snapshots(&store, &["alpha", "beta", "gamma"]).await;
    // Give the scheduler a few more passes
    sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["beta", "gamma", "alpha"]);
    assert!(!store.job_dir("off").exists());
    assert_eq!(
        store.list_backups("alpha").unwrap(),
        vec!["2024-05-03".to_string(), today_label()]
    );
}

#[tokio::test]
async fn test_cancelled_before_start_dispatches_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let engine = SimulatedEngine::new(Duration::from_millis(10));
    let stats = engine.stats();

    let scheduler = scheduler(
        temp.path(),
        vec![spec("web", true)],
        Arc::new(engine),
        shutdown,
        1,
    );
    let remaining = timeout(Duration::from_secs(2), scheduler.run())
        .await
        .expect("scheduler should stop immediately");

    assert!(remaining.is_empty());
    assert_eq!(stats.calls(), 0);
    assert!(!temp.path().join("web").exists());
}

#[tokio::test]
async fn test_shutdown_waits_for_running_job() {
    let temp = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let engine = SimulatedEngine::new(Duration::from_millis(300));
    let stats = engine.stats();

    let scheduler = scheduler(
        temp.path(),
        vec![spec("web", true)],
        Arc::new(engine),
        shutdown.clone(),
        1,
    );
    let handle = tokio::spawn(scheduler.run());

    let store = SnapshotStore::new(temp.path());
    wait_for_calls(|| stats.calls(), 1).await;
    shutdown.cancel();
    let remaining = handle.await.unwrap();

    assert!(remaining.is_empty());
    assert!(store.has_today_label("web"));
}

#[tokio::test]
async fn test_single_slot_runs_jobs_one_after_another() {
    let temp = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let engine = SimulatedEngine::new(Duration::from_millis(150));
    let stats = engine.stats();

    let names = ["a", "b", "c"];
    let specs = names.iter().map(|n| spec(n, true)).collect();
    let scheduler = scheduler(temp.path(), specs, Arc::new(engine), shutdown.clone(), 1);
    let handle = tokio::spawn(scheduler.run());

    wait_for_snapshots(&SnapshotStore::new(temp.path()), &names).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(stats.calls(), 3);
    assert_eq!(stats.peak_concurrency(), 1);
}

#[tokio::test]
async fn test_shutdown_while_waiting_for_slot_starts_nothing_new() {
    let temp = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let engine = SimulatedEngine::new(Duration::from_millis(600));
    let stats = engine.stats();

    let specs = vec![spec("a", true), spec("b", true)];
    let scheduler = scheduler(temp.path(), specs, Arc::new(engine), shutdown.clone(), 1);
    let handle = tokio::spawn(scheduler.run());

    wait_for_calls(|| stats.calls(), 1).await;
    // Let the scheduler reach the second job and block on the gate
    sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let remaining = handle.await.unwrap();

    assert!(remaining.is_empty());
    assert_eq!(stats.calls(), 1);
    let store = SnapshotStore::new(temp.path());
    let started: Vec<&str> = ["a", "b"]
        .into_iter()
        .filter(|job| store.job_dir(job).exists())
        .collect();
    assert_eq!(started.len(), 1, "started {started:?}");
    assert!(store.has_today_label(started[0]));
}

#[tokio::test]
async fn test_unreachable_host_is_retried_once_per_poll_interval() {
    let temp = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let engine = SimulatedEngine::new(Duration::from_millis(10));
    let stats = engine.stats();
    let probe = Arc::new(DeadHost::default());

    let scheduler = scheduler_with(
        temp.path(),
        vec![spec("web", true)],
        Arc::new(engine),
        probe.clone(),
        shutdown.clone(),
        SchedulerOptions {
            max_jobs: 1,
            poll_interval: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
        },
    );
    let handle = tokio::spawn(scheduler.run());

    sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    handle.await.unwrap();

    let probes = probe.probes.load(Ordering::SeqCst);
    assert!((2..=7).contains(&probes), "{probes} probes in 1s");
    assert_eq!(stats.calls(), 0);
}

#[tokio::test]
async fn test_abort_cuts_shutdown_drain_short() {
    let temp = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    let engine = SimulatedEngine::new(Duration::from_secs(30));
    let stats = engine.stats();

    let scheduler = scheduler_with(
        temp.path(),
        vec![spec("web", true)],
        Arc::new(engine),
        Arc::new(StaticProbe(true)),
        shutdown.clone(),
        SchedulerOptions {
            max_jobs: 1,
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(60),
        },
    )
    .with_abort(abort.clone());
    let handle = tokio::spawn(scheduler.run());

    wait_for_calls(|| stats.calls(), 1).await;
    shutdown.cancel();
    sleep(Duration::from_millis(50)).await;
    abort.cancel();

    let mut remaining = timeout(Duration::from_secs(2), handle)
        .await
        .expect("drain should stop on abort")
        .unwrap();
    assert_eq!(remaining.len(), 1);
    remaining.abort_all();
    assert!(!SnapshotStore::new(temp.path()).has_today_label("web"));
}
