use crate::context::ChildRegistry;
use crate::core::transfer_engine::{
    EXIT_OK, EXIT_VANISHED, TransferEngine, TransferExit, TransferRequest,
};
use anyhow::Result;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, sleep};
use tracing::info;

/// Marker written into staging by a successful simulated transfer.
pub const SIMULATION_MARKER: &str = ".uberbackup-simulated";

/// Transfer engine that never touches the network.
///
/// Each call sleeps for `delay` and then exits with the next code from the
/// script, or success once the script is exhausted. Successful runs leave a
/// marker file in the destination.
pub struct SimulatedEngine {
    pub delay: Duration,
    script: Arc<Mutex<VecDeque<i32>>>,
    stats: Arc<SimulationStats>,
}

/// Counters used to observe simulated runs.
#[derive(Debug, Default)]
pub struct SimulationStats {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SimulationStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of transfers observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl SimulatedEngine {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            script: Arc::new(Mutex::new(VecDeque::new())),
            stats: Arc::new(SimulationStats::default()),
        }
    }

    /// Exit codes returned by the next calls, in order.
    pub fn scripted(delay: Duration, codes: impl IntoIterator<Item = i32>) -> Self {
        let engine = Self::new(delay);
        engine
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(codes);
        engine
    }

    pub fn stats(&self) -> Arc<SimulationStats> {
        self.stats.clone()
    }
}

impl TransferEngine for SimulatedEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
        _children: &ChildRegistry,
    ) -> Pin<Box<dyn Future<Output = Result<TransferExit>> + Send>> {
        let req = req.clone();
        let delay = self.delay;
        let script = self.script.clone();
        let stats = self.stats.clone();

        Box::pin(async move {
            stats.enter();
            sleep(delay).await;

            let code = script
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or(EXIT_OK);

            let result = if code == EXIT_OK || code == EXIT_VANISHED {
                write_marker(&req).await.map(|_| TransferExit::code(code))
            } else {
                Ok(TransferExit::code(code))
            };

            info!(job = %req.job, code, "(Simulated) Transfer finished");
            stats.leave();
            result
        })
    }
}

/// Staging content may be hard-linked to older snapshots, so the marker is
/// replaced by rename instead of being rewritten in place.
async fn write_marker(req: &TransferRequest) -> Result<()> {
    tokio::fs::create_dir_all(&req.destination).await?;
    let tmp = req.destination.join(format!("{SIMULATION_MARKER}.tmp"));
    let body = format!("{}@{}\n", req.remote_path, req.host);
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, req.destination.join(SIMULATION_MARKER)).await?;
    Ok(())
}
