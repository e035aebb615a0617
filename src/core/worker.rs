//! A single worker invocation: prepare, transfer, report.
//!
//! ```text
//! Idle -> Preparing -> Transferring -> Succeeded | Failed
//!                       ^    |
//!                       +----+ timeout
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::OwnedSemaphorePermit;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::models::JobSpec;
use super::notifications::{JobEvent, NotificationChannel};
use super::rotation::Rotator;
use super::runner::{Outcome, TransferRunner};
use crate::error::FsOpError;

/// What a worker holds while it runs: one unit of the concurrency gate and
/// the job's `running` flag.
///
/// Dropping the slot clears the flag, then returns the permit. It is moved
/// into the worker, so this happens exactly once per invocation whichever
/// way the worker ends.
pub struct WorkerSlot {
    running: Arc<AtomicBool>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    pub fn new(running: Arc<AtomicBool>, permit: OwnedSemaphorePermit) -> Self {
        running.store(true, Ordering::Release);
        Self {
            running,
            _permit: permit,
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

pub struct Worker {
    rotator: Rotator,
    runner: TransferRunner,
    notifiers: Vec<Arc<dyn NotificationChannel>>,
}

impl Worker {
    pub fn new(
        rotator: Rotator,
        runner: TransferRunner,
        notifiers: Vec<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self {
            rotator,
            runner,
            notifiers,
        }
    }

    pub async fn execute(&self, job: Arc<JobSpec>, slot: WorkerSlot) -> Outcome {
        let span = info_span!("job", job = %job.name, run_id = %Uuid::now_v7());
        async move {
            let started = Instant::now();
            let outcome = self.attempt(&job).await;
            drop(slot);

            let event = match &outcome {
                Outcome::Success { label, attempts } => JobEvent::Completed {
                    job: job.name.clone(),
                    label: label.clone(),
                    attempts: *attempts,
                    duration_secs: started.elapsed().as_secs(),
                },
                other => {
                    error!(outcome = %other, "Job failed");
                    JobEvent::Failed {
                        job: job.name.clone(),
                        reason: other.to_string(),
                    }
                }
            };
            self.notify(event).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, job: &JobSpec) -> Outcome {
        debug!("Preparing");
        let rotator = self.rotator.clone();
        let name = job.name.clone();
        let prepared = tokio::task::spawn_blocking(move || rotator.prepare(&name))
            .await
            .map_err(FsOpError::from)
            .and_then(|prepared| prepared);
        match prepared {
            Ok(prepared) => debug!(prepared = ?prepared, "Prepared staging"),
            Err(e) => {
                error!(error = %e, "Prepare failed");
                return Outcome::Failure {
                    reason: e.to_string(),
                };
            }
        }

        info!("Starting job");
        self.runner.run(job).await
    }

    async fn notify(&self, event: JobEvent) {
        for channel in &self.notifiers {
            if let Err(e) = channel.notify(event.clone()).await {
                warn!(error = %e, "Failed to send notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn test_slot_releases_flag_and_permit_once() {
        let gate = Arc::new(Semaphore::new(1));
        let running = Arc::new(AtomicBool::new(false));

        let permit = gate.clone().acquire_owned().await.unwrap();
        let slot = WorkerSlot::new(running.clone(), permit);
        assert!(running.load(Ordering::Acquire));
        assert_eq!(gate.available_permits(), 0);

        drop(slot);
        assert!(!running.load(Ordering::Acquire));
        assert_eq!(gate.available_permits(), 1);
    }
}
