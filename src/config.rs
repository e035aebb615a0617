//! Configuration loading.
//!
//! The file is TOML with a `[global]` table and one `[jobs.<name>]` table per
//! backup source. Values are layered with figment: file, then `UBERBACKUP_`
//! environment variables (nested keys split on `__`), then command line
//! overrides. Everything is validated once here and turned into a fixed
//! list of [`JobSpec`]s.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::models::{JobSpec, STAGING_DIR};
use crate::error::ConfigError;

pub const DEFAULT_BASE_DIR: &str = "/var/lib/uberbackup";
const CONFIG_FILE: &str = "conf/uberbackup.toml";
const PID_FILE: &str = "run/uberbackup.pid";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 2;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 600;

static JOB_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid job name regex"));

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub global: GlobalConfig,
    pub jobs: Vec<JobSpec>,
    /// Job sections that were ignored, with the reason. Reported once
    /// logging is up.
    pub skipped: Vec<SkippedJob>,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub ssh_user: String,
    pub ssh_key: PathBuf,
    pub ssh_opts: String,
    pub rsync_opts: String,
    pub rsync_path: String,
    /// Retention limit: snapshots kept per job.
    pub max_backups: usize,
    /// Size of the concurrency gate.
    pub max_jobs: usize,
    pub mailto: Option<String>,
    pub slack_webhook: Option<String>,
    pub log_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub shutdown_grace: Duration,
    /// `None` retries timed out transfers forever.
    pub timeout_retry_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedJob {
    pub name: String,
    pub reason: String,
}

/// Values that can be set from the command line. Unset fields are not
/// serialized so they never shadow the file or the environment.
#[derive(Debug, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_logs: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    global: RawGlobal,
    #[serde(default)]
    jobs: BTreeMap<String, RawJob>,
    #[serde(default)]
    simulation: bool,
    #[serde(default)]
    verbose: bool,
    #[serde(default)]
    json_logs: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobal {
    ssh_user: Option<String>,
    ssh_key: Option<PathBuf>,
    ssh_opts: Option<String>,
    rsync_opts: Option<String>,
    rsync_path: Option<String>,
    max_backups: Option<usize>,
    max_jobs: Option<usize>,
    mailto: Option<String>,
    slack_webhook: Option<String>,
    log_file: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    poll_interval_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    shutdown_grace_secs: Option<u64>,
    timeout_retry_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawJob {
    host: Option<String>,
    path: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// Default location of the config file for a base directory.
    pub fn default_path(base_dir: &Path) -> PathBuf {
        base_dir.join(CONFIG_FILE)
    }

    /// Load the layered configuration for `base_dir`.
    pub fn load(
        base_dir: &Path,
        config_file: Option<&Path>,
        overrides: &Overrides,
    ) -> Result<Self, ConfigError> {
        let path = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Self::default_path(base_dir));

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("UBERBACKUP_").split("__"))
            .merge(Serialized::defaults(overrides));

        Self::from_figment(base_dir, figment)
    }

    /// Validate whatever the given figment resolves to.
    pub fn from_figment(base_dir: &Path, figment: Figment) -> Result<Self, ConfigError> {
        let raw: RawConfig = figment.extract()?;
        let global = validate_global(raw.global)?;

        let mut jobs = Vec::new();
        let mut skipped = Vec::new();
        for (name, job) in raw.jobs {
            match validate_job(&name, job) {
                Ok(spec) => jobs.push(spec),
                Err(reason) => skipped.push(SkippedJob { name, reason }),
            }
        }

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            global,
            jobs,
            skipped,
            simulation: raw.simulation,
            verbose: raw.verbose,
            json_logs: raw.json_logs,
        })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.global
            .pid_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(PID_FILE))
    }
}

fn require<T>(value: Option<T>, key: &'static str) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::MissingRequired(key))
}

fn at_least_one(value: usize, key: &str) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key: format!("global.{key}"),
            reason: "must be at least 1".into(),
        });
    }
    Ok(value)
}

fn validate_global(raw: RawGlobal) -> Result<GlobalConfig, ConfigError> {
    let ssh_user = require(raw.ssh_user, "ssh_user")?;
    let ssh_key = require(raw.ssh_key, "ssh_key")?;
    let rsync_opts = require(raw.rsync_opts, "rsync_opts")?;
    let max_backups = at_least_one(require(raw.max_backups, "max_backups")?, "max_backups")?;
    let max_jobs = at_least_one(require(raw.max_jobs, "max_jobs")?, "max_jobs")?;

    Ok(GlobalConfig {
        ssh_user,
        ssh_key,
        ssh_opts: raw.ssh_opts.unwrap_or_default(),
        rsync_opts,
        rsync_path: raw.rsync_path.unwrap_or_else(|| "rsync".into()),
        max_backups,
        max_jobs,
        mailto: raw.mailto.filter(|s| !s.trim().is_empty()),
        slack_webhook: raw.slack_webhook.filter(|s| !s.trim().is_empty()),
        log_file: raw.log_file,
        pid_file: raw.pid_file,
        poll_interval: Duration::from_secs(
            raw.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        ),
        probe_timeout: Duration::from_secs(
            raw.probe_timeout_secs
                .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS)
                .max(1),
        ),
        shutdown_grace: Duration::from_secs(
            raw.shutdown_grace_secs
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
        ),
        timeout_retry_limit: raw.timeout_retry_limit,
    })
}

fn validate_job(name: &str, raw: RawJob) -> Result<JobSpec, String> {
    if name == STAGING_DIR || !JOB_NAME.is_match(name) {
        return Err(format!("invalid job name '{name}'"));
    }
    let host = raw
        .host
        .filter(|h| !h.is_empty())
        .ok_or_else(|| "missing config option: host".to_string())?;
    let remote_path = raw
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| "missing config option: path".to_string())?;

    Ok(JobSpec {
        name: name.to_string(),
        host,
        remote_path,
        enabled: raw.enabled,
        include: clean_patterns(raw.include),
        exclude: clean_patterns(raw.exclude),
    })
}

fn clean_patterns(patterns: Vec<String>) -> Vec<String> {
    patterns
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
