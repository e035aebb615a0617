use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{Local, NaiveDate};
use serde::Serialize;

/// Directory name reserved for the in-progress (staging) backup of a job.
pub const STAGING_DIR: &str = "current";

/// Label used for a job that has never completed a backup.
pub const EPOCH_LABEL: &str = "1970-01-01";

/// Format of snapshot directory names. Fixed width, so lexicographic order
/// equals chronological order.
pub const LABEL_FORMAT: &str = "%Y-%m-%d";

/// Immutable description of one configured backup source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    /// Unique name, also the directory under `data/`.
    pub name: String,
    pub host: String,
    pub remote_path: String,
    pub enabled: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// A job as tracked by the scheduler.
///
/// `running` is shared with the worker executing this job, which clears it
/// when it finishes. `last_backup` and `not_before` are only ever written by
/// the scheduler.
#[derive(Debug, Clone)]
pub struct Job {
    pub spec: Arc<JobSpec>,
    pub running: Arc<AtomicBool>,
    pub last_backup: String,
    /// Earliest time the job may be started again.
    pub not_before: Option<Instant>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec: Arc::new(spec),
            running: Arc::new(AtomicBool::new(false)),
            last_backup: EPOCH_LABEL.to_string(),
            not_before: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// False while the job is held back after its last start.
    pub fn may_start(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|at| now >= at)
    }
}

/// Snapshot label for an arbitrary date.
pub fn label_for(date: NaiveDate) -> String {
    date.format(LABEL_FORMAT).to_string()
}

/// Snapshot label for the current local day.
pub fn today_label() -> String {
    label_for(Local::now().date_naive())
}

/// Parse a snapshot label back into a date. Entries that are not dates
/// (left behind by hand, for instance) return `None`.
pub fn parse_label(label: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(label, LABEL_FORMAT).ok()
}
