//! Host reachability check run before every transfer attempt.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::context::ChildRegistry;

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, host: &str, children: &ChildRegistry) -> bool;
}

/// Sends a single ICMP echo with `ping -c 1`.
pub struct PingProbe {
    pub timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn is_reachable(&self, host: &str, children: &ChildRegistry) -> bool {
        let wait = self.timeout.as_secs().max(1).to_string();
        let child = Command::new("ping")
            .args(["-c", "1", "-W", &wait, host])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(host, error = %e, "Failed to spawn ping");
                return false;
            }
        };
        let _guard = child
            .id()
            .map(|pid| children.register(pid, format!("ping {host}")));

        match child.wait().await {
            Ok(status) => {
                debug!(host, status = %status, "Probe finished");
                status.success()
            }
            Err(e) => {
                warn!(host, error = %e, "Failed to wait for ping");
                false
            }
        }
    }
}

/// Probe with a fixed answer, used in simulation mode.
pub struct StaticProbe(pub bool);

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn is_reachable(&self, _host: &str, _children: &ChildRegistry) -> bool {
        self.0
    }
}
