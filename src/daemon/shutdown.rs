use std::io;

use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Cancel `shutdown` on the first SIGTERM or SIGINT and `abort` on the next.
///
/// The first signal only stops new jobs from starting: running workers
/// finish their current attempt. The second one stops waiting for them.
pub fn install_shutdown_handler(
    shutdown: CancellationToken,
    abort: CancellationToken,
) -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            name = next_signal(&mut sigterm, &mut sigint) => {
                tracing::info!(signal = name, "Initiating graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();

        tokio::select! {
            name = next_signal(&mut sigterm, &mut sigint) => {
                tracing::warn!(signal = name, "Second signal received, forcing shutdown");
                abort.cancel();
            }
            _ = abort.cancelled() => {}
        }
    });

    Ok(())
}

async fn next_signal(sigterm: &mut Signal, sigint: &mut Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
