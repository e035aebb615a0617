//! One transfer attempt of a job, from reachability probe to promotion.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::history::SnapshotStore;
use super::models::{JobSpec, today_label};
use super::probe::ReachabilityProbe;
use super::transfer_engine::{TransferEngine, TransferRequest, TransferStatus};
use crate::context::ChildRegistry;
use crate::error::FsOpError;

/// Terminal result of a worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Staging was promoted to `label`.
    Success { label: String, attempts: u32 },
    /// The probe failed; nothing was transferred.
    HostUnreachable,
    /// The transfer or the promotion failed. Staging stays for the next cycle.
    Failure { reason: String },
    /// Every attempt timed out and the configured retry limit was reached.
    TimedOut { attempts: u32 },
    /// Shutdown was requested while a timed out transfer was about to restart.
    Interrupted { attempts: u32 },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success { label, attempts } => {
                write!(f, "snapshot {label} after {attempts} attempt(s)")
            }
            Outcome::HostUnreachable => write!(f, "host unreachable"),
            Outcome::Failure { reason } => write!(f, "{reason}"),
            Outcome::TimedOut { attempts } => {
                write!(f, "transfer timed out {attempts} time(s), giving up")
            }
            Outcome::Interrupted { attempts } => {
                write!(f, "interrupted by shutdown after {attempts} attempt(s)")
            }
        }
    }
}

/// Runs transfers into `data/<job>/current` and finalizes them.
pub struct TransferRunner {
    store: SnapshotStore,
    engine: Arc<dyn TransferEngine>,
    probe: Arc<dyn ReachabilityProbe>,
    children: ChildRegistry,
    shutdown: CancellationToken,
    retry_limit: Option<u32>,
}

impl TransferRunner {
    pub fn new(
        store: SnapshotStore,
        engine: Arc<dyn TransferEngine>,
        probe: Arc<dyn ReachabilityProbe>,
        children: ChildRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            engine,
            probe,
            children,
            shutdown,
            retry_limit: None,
        }
    }

    /// Cap the number of restarts after a timeout. Unbounded by default.
    pub fn with_retry_limit(mut self, limit: Option<u32>) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Probe, transfer (restarting on timeouts) and promote on success.
    ///
    /// Staging is only ever renamed, never removed: on every path except
    /// `Success` it stays in place as the marker of an unfinished backup.
    pub async fn run(&self, job: &JobSpec) -> Outcome {
        if !self.probe.is_reachable(&job.host, &self.children).await {
            warn!(host = %job.host, "Host unreachable, skipping attempt");
            return Outcome::HostUnreachable;
        }

        let req = TransferRequest {
            job: job.name.clone(),
            host: job.host.clone(),
            remote_path: job.remote_path.clone(),
            destination: self.store.staging_dir(&job.name),
            include: job.include.clone(),
            exclude: job.exclude.clone(),
        };

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            info!(attempt = attempts, "Starting transfer");

            let exit = match self.engine.transfer(&req, &self.children).await {
                Ok(exit) => exit,
                Err(e) => {
                    error!(error = %e, "Transfer could not run");
                    return Outcome::Failure {
                        reason: format!("could not run transfer: {e}"),
                    };
                }
            };

            match exit.status() {
                TransferStatus::Complete => return self.promote(&job.name, attempts).await,
                TransferStatus::Timeout => {
                    if let Some(limit) = self.retry_limit {
                        if attempts > limit {
                            warn!(attempts, "Transfer timed out, retry limit reached");
                            return Outcome::TimedOut { attempts };
                        }
                    }
                    if self.shutdown.is_cancelled() {
                        info!(attempts, "Transfer timed out during shutdown, not restarting");
                        return Outcome::Interrupted { attempts };
                    }
                    warn!(attempts, "Transfer timed out, restarting");
                }
                TransferStatus::Failed(code) => {
                    let reason = match code {
                        Some(code) => format!("transfer failed (code = {code})"),
                        None => "transfer killed by signal".to_string(),
                    };
                    error!(reason = %reason, "Transfer failed");
                    return Outcome::Failure { reason };
                }
            }
        }
    }

    /// Rename staging to today's label. A single rename, so `list_backups`
    /// sees either `current` or the dated snapshot, never both.
    async fn promote(&self, job: &str, attempts: u32) -> Outcome {
        let label = today_label();
        let from = self.store.staging_dir(job);
        let to = self.store.snapshot_dir(job, &label);

        if to.exists() {
            let reason = format!("snapshot {label} already exists, keeping current");
            error!(reason = %reason, "Promotion skipped");
            return Outcome::Failure { reason };
        }

        match tokio::fs::rename(&from, &to).await {
            Ok(()) => {
                info!(snapshot = %label, attempts, "Job finished successfully");
                Outcome::Success { label, attempts }
            }
            Err(source) => {
                let err = FsOpError::Promote { from, to, source };
                error!(error = %err, "Promotion failed");
                Outcome::Failure {
                    reason: err.to_string(),
                }
            }
        }
    }
}
