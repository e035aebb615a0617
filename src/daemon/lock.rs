//! PID marker guaranteeing a single daemon instance.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::DaemonError;

/// Held by the running daemon. The file is created exclusively and removed
/// on release (or drop).
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    released: bool,
}

impl PidLock {
    /// Create the marker and record the current pid in it. Fails with
    /// `AlreadyRunning` if the marker exists, whoever wrote it.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(DaemonError::AlreadyRunning {
                    path: path.to_path_buf(),
                    pid: read_pid(path).ok(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let lock = Self {
            path: path.to_path_buf(),
            released: false,
        };
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Removed lock"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove lock"),
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Fail early, before daemonizing, when a marker is already present.
pub fn ensure_not_running(path: &Path) -> Result<(), DaemonError> {
    if path.exists() {
        return Err(DaemonError::AlreadyRunning {
            path: path.to_path_buf(),
            pid: read_pid(path).ok(),
        });
    }
    Ok(())
}

pub fn read_pid(path: &Path) -> Result<i32, DaemonError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(DaemonError::NotRunning {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(e.into()),
    };
    content
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| DaemonError::InvalidLock {
            path: path.to_path_buf(),
        })
}

/// Whether a process with this pid exists (it may belong to another user).
pub fn is_alive(pid: i32) -> bool {
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Pid of the running daemon, if the marker names a live process.
pub fn running_pid(path: &Path) -> Option<i32> {
    read_pid(path).ok().filter(|pid| is_alive(*pid))
}

/// Ask the daemon recorded in `path` to shut down gracefully.
///
/// A marker naming a dead process is removed and reported as stale.
pub fn stop(path: &Path) -> Result<i32, DaemonError> {
    let pid = read_pid(path)?;
    if !is_alive(pid) {
        fs::remove_file(path)?;
        return Err(DaemonError::StaleLock {
            path: path.to_path_buf(),
            pid,
        });
    }

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|source| DaemonError::Signal { pid, source })?;
    Ok(pid)
}
