//! Error types shared across the daemon.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading and validating the configuration.
///
/// Only global problems surface here. A job section with missing keys is
/// skipped with a warning during validation and never becomes an error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required config option: global.{0}")]
    MissingRequired(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Load(Box::new(e))
    }
}

/// Filesystem operations on a job's snapshot history.
#[derive(Error, Debug)]
pub enum FsOpError {
    #[error("failed to create data directory {}: {source}", .path.display())]
    DataDir { path: PathBuf, source: io::Error },

    #[error("failed to list snapshots in {}: {source}", .path.display())]
    List { path: PathBuf, source: io::Error },

    #[error("failed to remove snapshot {}: {source}", .path.display())]
    Prune { path: PathBuf, source: io::Error },

    #[error("failed to clone {} into {}: {source}", .from.display(), .to.display())]
    Clone {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("failed to create staging directory {}: {source}", .path.display())]
    Staging { path: PathBuf, source: io::Error },

    #[error("failed to promote {} to {}: {source}", .from.display(), .to.display())]
    Promote {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("blocking filesystem task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Lifecycle errors of the daemon process.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("already running (lock {}{})", .path.display(), .pid.map(|p| format!(", pid {p}")).unwrap_or_default())]
    AlreadyRunning { path: PathBuf, pid: Option<i32> },

    #[error("not running (no lock at {})", .path.display())]
    NotRunning { path: PathBuf },

    #[error("stale lock {} names dead process {pid}", .path.display())]
    StaleLock { path: PathBuf, pid: i32 },

    #[error("lock {} does not contain a valid pid", .path.display())]
    InvalidLock { path: PathBuf },

    #[error("failed to signal process {pid}: {source}")]
    Signal { pid: i32, source: nix::Error },

    #[error("failed to daemonize: {0}")]
    Daemonize(nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
