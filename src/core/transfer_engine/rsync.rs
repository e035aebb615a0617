use crate::config::GlobalConfig;
use crate::context::ChildRegistry;
use crate::core::transfer_engine::{TransferEngine, TransferExit, TransferRequest};
use anyhow::{Result, anyhow};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Pulls `user@host:path` into the staging directory over ssh.
///
/// rsync writes changed files to a temporary name and renames them into
/// place, so inodes shared with older snapshots are never modified. Options
/// such as `--inplace` would break that and must not be configured.
#[derive(Debug, Clone)]
pub struct RsyncEngine {
    pub ssh_user: String,
    pub ssh_key: PathBuf,
    pub ssh_opts: String,
    pub rsync_opts: String,
    pub rsync_path: String,
}

impl RsyncEngine {
    pub fn from_config(global: &GlobalConfig) -> Self {
        Self {
            ssh_user: global.ssh_user.clone(),
            ssh_key: global.ssh_key.clone(),
            ssh_opts: global.ssh_opts.clone(),
            rsync_opts: global.rsync_opts.clone(),
            rsync_path: global.rsync_path.clone(),
        }
    }

    /// Full argument list, without the program name.
    pub fn args(&self, req: &TransferRequest) -> Vec<String> {
        let mut args: Vec<String> = self.rsync_opts.split_whitespace().map(str::to_owned).collect();

        let mut ssh = String::from("ssh");
        if !self.ssh_opts.trim().is_empty() {
            ssh.push(' ');
            ssh.push_str(self.ssh_opts.trim());
        }
        ssh.push_str(&format!(" -i {}", self.ssh_key.display()));
        args.push("-e".into());
        args.push(ssh);
        args.push(format!("--rsync-path={}", self.rsync_path));

        // rsync applies the first matching rule, so includes go first
        args.extend(req.include.iter().map(|p| format!("--include={p}")));
        args.extend(req.exclude.iter().map(|p| format!("--exclude={p}")));

        args.push(format!("{}@{}:{}", self.ssh_user, req.host, req.remote_path));
        args.push(req.destination.to_string_lossy().into_owned());
        args
    }
}

impl TransferEngine for RsyncEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
        children: &ChildRegistry,
    ) -> Pin<Box<dyn Future<Output = Result<TransferExit>> + Send>> {
        let args = self.args(req);
        let job = req.job.clone();
        let children = children.clone();

        Box::pin(async move {
            info!(job = %job, "(Rsync) Starting transfer");
            debug!(job = %job, args = ?args, "rsync arguments");

            let mut child_process = Command::new("rsync")
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| anyhow!("Failed to spawn rsync process: {}", e))?;

            let _guard = child_process
                .id()
                .map(|pid| children.register(pid, format!("rsync {job}")));

            let status = child_process
                .wait()
                .await
                .map_err(|e| anyhow!("Failed to wait for rsync: {}", e))?;

            debug!(job = %job, status = %status, "rsync exited");
            Ok(TransferExit {
                code: status.code(),
            })
        })
    }
}
