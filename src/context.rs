use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

/// State shared by the controller, the scheduler and every worker.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub shutdown: CancellationToken,
    /// Cancelled on a second termination signal: stop waiting for workers.
    pub abort: CancellationToken,
    pub children: ChildRegistry,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            children: ChildRegistry::new(),
        }
    }
}

/// External processes spawned by workers (probes, transfers), tracked so
/// the daemon can terminate leftovers on its way out.
#[derive(Clone, Default)]
pub struct ChildRegistry {
    inner: Arc<Mutex<HashMap<u32, String>>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `pid` until the returned guard is dropped.
    pub fn register(&self, pid: u32, label: impl Into<String>) -> ChildGuard {
        let label = label.into();
        debug!(pid, label = %label, "Child process started");
        self.lock().insert(pid, label);
        ChildGuard {
            registry: self.clone(),
            pid,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pids(&self) -> Vec<u32> {
        self.lock().keys().copied().collect()
    }

    /// Send SIGTERM to every child still registered. Returns how many were
    /// signalled.
    pub fn terminate_all(&self) -> usize {
        let children: Vec<(u32, String)> = self
            .lock()
            .iter()
            .map(|(pid, label)| (*pid, label.clone()))
            .collect();

        let mut signalled = 0;
        for (pid, label) in children {
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => {
                    info!(pid, label = %label, "Terminated child process");
                    signalled += 1;
                }
                Err(e) => warn!(pid, label = %label, error = %e, "Failed to terminate child process"),
            }
        }
        signalled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, String>> {
        // A panic while holding the lock cannot leave the map inconsistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes its child from the registry when dropped.
pub struct ChildGuard {
    registry: ChildRegistry,
    pid: u32,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_deregisters_on_drop() {
        let registry = ChildRegistry::new();
        let guard = registry.register(4242, "rsync web");
        assert_eq!(registry.pids(), vec![4242]);
        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_all_signals_live_children() {
        let registry = ChildRegistry::new();
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let _guard = registry.register(child.id().unwrap(), "sleep");

        assert_eq!(registry.terminate_all(), 1);
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
