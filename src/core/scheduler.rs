//! Picks the next due job and bounds how many run at once.
//!
//! The scheduler walks its job list with a round-robin cursor. A job is
//! skipped when it is disabled, already running or already has today's
//! snapshot, and a job started less than one poll interval ago is held
//! back. Starting a job takes one permit of the concurrency gate and
//! waiting for a permit blocks the loop, so the gate throttles job starts.
//! After every full pass the list is re-sorted oldest snapshot first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::SnapshotStore;
use super::models::{Job, JobSpec};
use super::notifications::create_notifiers;
use super::probe::{PingProbe, ReachabilityProbe, StaticProbe};
use super::rotation::Rotator;
use super::runner::{Outcome, TransferRunner};
use super::transfer_engine::create_engine;
use super::worker::{Worker, WorkerSlot};
use crate::context::AppContext;
use crate::logging::LogThrottle;

const IDLE_LOG_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_jobs: usize,
    pub poll_interval: Duration,
    /// How long to wait for running workers once shutdown is requested.
    pub shutdown_grace: Duration,
}

/// Sent by a worker when it is done.
#[derive(Debug)]
struct Completion {
    job: String,
    outcome: Outcome,
}

enum Dispatch {
    Spawned,
    Skipped,
    Shutdown,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    cursor: usize,
    store: SnapshotStore,
    gate: Arc<Semaphore>,
    worker: Arc<Worker>,
    shutdown: CancellationToken,
    /// Cuts the shutdown drain short.
    abort: CancellationToken,
    options: SchedulerOptions,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    tasks: JoinSet<()>,
    idle_log: LogThrottle,
}

impl Scheduler {
    pub fn new(
        specs: Vec<JobSpec>,
        store: SnapshotStore,
        worker: Arc<Worker>,
        shutdown: CancellationToken,
        options: SchedulerOptions,
    ) -> Self {
        let mut jobs: Vec<Job> = specs.into_iter().map(Job::new).collect();
        store.refresh_ordering(&mut jobs);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        Self {
            jobs,
            cursor: 0,
            store,
            gate: Arc::new(Semaphore::new(options.max_jobs.max(1))),
            worker,
            shutdown,
            abort: CancellationToken::new(),
            options,
            done_tx,
            done_rx,
            tasks: JoinSet::new(),
            idle_log: LogThrottle::new(IDLE_LOG_INTERVAL),
        }
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    /// Wire the real rotator, runner, engine and probe from the config.
    pub fn from_context(ctx: &AppContext) -> Self {
        let config = &ctx.config;
        let store = SnapshotStore::new(config.data_dir());

        let probe: Arc<dyn ReachabilityProbe> = if config.simulation {
            Arc::new(StaticProbe(true))
        } else {
            Arc::new(PingProbe::new(config.global.probe_timeout))
        };
        let runner = TransferRunner::new(
            store.clone(),
            create_engine(config),
            probe,
            ctx.children.clone(),
            ctx.shutdown.clone(),
        )
        .with_retry_limit(config.global.timeout_retry_limit);
        let rotator = Rotator::new(store.clone(), config.global.max_backups);
        let worker = Worker::new(rotator, runner, create_notifiers(&config.global));

        Self::new(
            config.jobs.clone(),
            store,
            Arc::new(worker),
            ctx.shutdown.clone(),
            SchedulerOptions {
                max_jobs: config.global.max_jobs,
                poll_interval: config.global.poll_interval,
                shutdown_grace: config.global.shutdown_grace,
            },
        )
        .with_abort(ctx.abort.clone())
    }

    /// Current order of the job list.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Run until the shutdown token is cancelled, then wait up to the grace
    /// period for running workers. Workers still running after that are
    /// handed back so the caller can stop their children first.
    pub async fn run(mut self) -> JoinSet<()> {
        info!(
            jobs = self.jobs.len(),
            max_jobs = self.options.max_jobs,
            "Scheduler started"
        );

        let mut spawned_in_pass = false;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if self.jobs.is_empty() {
                if !self.idle().await {
                    break;
                }
                continue;
            }

            match self.dispatch(self.cursor).await {
                Dispatch::Shutdown => break,
                Dispatch::Skipped => {}
                Dispatch::Spawned => {
                    spawned_in_pass = true;
                    if !self.idle().await {
                        break;
                    }
                }
            }

            self.cursor += 1;
            if self.cursor >= self.jobs.len() {
                self.cursor = 0;
                if !spawned_in_pass {
                    if self.tasks.is_empty() && self.idle_log.should_log() {
                        info!("All jobs up to date");
                    }
                    if !self.idle().await {
                        break;
                    }
                }
                spawned_in_pass = false;
                self.store.refresh_ordering(&mut self.jobs);
            }
        }

        info!("Scheduler stopping");
        self.drain().await;
        self.tasks
    }

    async fn dispatch(&mut self, idx: usize) -> Dispatch {
        if !self.is_due(idx) {
            return Dispatch::Skipped;
        }

        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Dispatch::Shutdown,
            permit = self.gate.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Dispatch::Shutdown,
            },
        };
        if self.shutdown.is_cancelled() {
            return Dispatch::Shutdown;
        }
        // The wait may have been long; the snapshot could exist by now.
        if !self.is_due(idx) {
            return Dispatch::Skipped;
        }

        let poll_interval = self.options.poll_interval;
        let job = &mut self.jobs[idx];
        // A job that fails fast must not be restarted on the next pass.
        job.not_before = Some(Instant::now() + poll_interval);
        let slot = WorkerSlot::new(job.running.clone(), permit);
        let spec = job.spec.clone();
        let worker = self.worker.clone();
        let done_tx = self.done_tx.clone();

        info!(job = %spec.name, last_backup = %job.last_backup, "Dispatching job");
        self.idle_log.reset();
        self.tasks.spawn(async move {
            let outcome = worker.execute(spec.clone(), slot).await;
            let _ = done_tx.send(Completion {
                job: spec.name.clone(),
                outcome,
            });
        });
        Dispatch::Spawned
    }

    fn is_due(&self, idx: usize) -> bool {
        let job = &self.jobs[idx];
        job.spec.enabled
            && !job.is_running()
            && job.may_start(Instant::now())
            && !self.store.has_today_label(job.name())
    }

    /// Wait for the poll interval, a worker completion or shutdown.
    /// Returns false on shutdown.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = sleep(self.options.poll_interval) => {
                self.reap();
                true
            }
            Some(done) = self.done_rx.recv() => {
                self.on_completion(done);
                self.reap();
                true
            }
        }
    }

    fn on_completion(&mut self, done: Completion) {
        debug!(job = %done.job, outcome = %done.outcome, "Worker finished");
        if let Outcome::Success { label, .. } = done.outcome {
            if let Some(job) = self.jobs.iter_mut().find(|j| j.name() == done.job) {
                job.last_backup = label;
            }
        }
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
    }

    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        info!(running = self.tasks.len(), "Waiting for running jobs to finish");

        let deadline = sleep(self.options.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(running = self.tasks.len(), "Shutdown grace period elapsed");
                    break;
                }
                _ = self.abort.cancelled() => {
                    warn!(running = self.tasks.len(), "Shutdown forced, not waiting for running jobs");
                    break;
                }
                next = self.tasks.join_next() => match next {
                    None => break,
                    Some(Err(e)) => error!(error = %e, "Worker task failed"),
                    Some(Ok(())) => {}
                },
            }
        }
    }
}
