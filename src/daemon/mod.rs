//! Daemon lifecycle: single instance lock, signal driven shutdown and
//! cleanup of leftover child processes.

pub mod lock;
pub mod shutdown;

use std::time::Duration;

use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::Scheduler;
use crate::error::DaemonError;
use lock::PidLock;

/// How long workers get to notice their children died before the process exits.
const CHILD_EXIT_WAIT: Duration = Duration::from_secs(5);

/// Detach from the terminal. Must run before the tokio runtime is built.
pub fn daemonize() -> Result<(), DaemonError> {
    nix::unistd::daemon(true, false).map_err(DaemonError::Daemonize)
}

/// Run the scheduler until a termination signal arrives.
///
/// Returns `AlreadyRunning` without touching any job directory when another
/// instance holds the lock.
pub async fn run(ctx: AppContext) -> Result<(), DaemonError> {
    let lock = PidLock::acquire(&ctx.config.pid_file())?;
    info!(
        pid = std::process::id(),
        lock = %lock.path().display(),
        version = env!("CARGO_PKG_VERSION"),
        "Daemon started"
    );

    if let Err(e) = shutdown::install_shutdown_handler(ctx.shutdown.clone(), ctx.abort.clone()) {
        lock.release();
        return Err(e.into());
    }

    run_locked(&ctx, lock).await;
    Ok(())
}

async fn run_locked(ctx: &AppContext, lock: PidLock) {
    let mut remaining = Scheduler::from_context(ctx).run().await;

    lock.release();

    let signalled = ctx.children.terminate_all();
    if signalled > 0 || !remaining.is_empty() {
        warn!(
            children = signalled,
            workers = remaining.len(),
            "Terminated leftover processes"
        );
        let drained = tokio::time::timeout(CHILD_EXIT_WAIT, async {
            while remaining.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(workers = remaining.len(), "Workers still running at exit");
            remaining.abort_all();
        }
    }

    info!("Daemon stopped");
}
