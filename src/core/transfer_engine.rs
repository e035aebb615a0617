mod rsync;
mod simulated;

use anyhow::Result;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::context::ChildRegistry;

pub use rsync::RsyncEngine;
pub use simulated::{SIMULATION_MARKER, SimulatedEngine, SimulationStats};

/// Exit code: full success.
pub const EXIT_OK: i32 = 0;
/// Exit code: partial transfer because source files vanished. Counted as a
/// completed backup.
pub const EXIT_VANISHED: i32 = 24;
/// Exit code: timeout in data send/receive. The attempt is restarted.
pub const EXIT_TIMEOUT: i32 = 30;

/// One transfer attempt of a job into its staging directory.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub job: String,
    pub host: String,
    pub remote_path: String,
    pub destination: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// How the external tool exited. `code` is `None` when it was killed by a
/// signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferExit {
    pub code: Option<i32>,
}

/// Classification of a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Complete,
    Timeout,
    Failed(Option<i32>),
}

impl TransferExit {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn status(&self) -> TransferStatus {
        match self.code {
            Some(EXIT_OK | EXIT_VANISHED) => TransferStatus::Complete,
            Some(EXIT_TIMEOUT) => TransferStatus::Timeout,
            other => TransferStatus::Failed(other),
        }
    }
}

pub trait TransferEngine: Send + Sync {
    /// Run the external transfer once. An `Err` means the tool could not be
    /// run at all; a non-zero exit is reported through `TransferExit`.
    fn transfer(
        &self,
        req: &TransferRequest,
        children: &ChildRegistry,
    ) -> Pin<Box<dyn Future<Output = Result<TransferExit>> + Send>>;
}

pub fn create_engine(config: &AppConfig) -> Arc<dyn TransferEngine> {
    if config.simulation {
        Arc::new(SimulatedEngine::default())
    } else {
        Arc::new(RsyncEngine::from_config(&config.global))
    }
}
