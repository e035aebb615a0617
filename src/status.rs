//! Read-only status report of every configured job.
//!
//! Nothing here writes to the data directory, so it is safe to run next to
//! a live daemon.

use std::fmt::Write as _;

use chrono::NaiveDate;
use crossterm::style::Stylize;
use serde::Serialize;

use crate::config::AppConfig;
use crate::core::history::SnapshotStore;
use crate::core::models::{EPOCH_LABEL, Job, parse_label};
use crate::daemon::lock;

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    /// `None` when the job never completed a backup.
    pub last_backup: Option<String>,
    pub age_days: Option<i64>,
    pub enabled: bool,
    /// A staging directory exists: a backup is running or was interrupted.
    pub in_progress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub daemon_pid: Option<i32>,
    pub jobs: Vec<JobStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Aging,
    Stale,
}

impl Staleness {
    pub fn of(age_days: Option<i64>) -> Self {
        match age_days {
            Some(days) if days <= 1 => Staleness::Fresh,
            Some(days) if days <= 7 => Staleness::Aging,
            _ => Staleness::Stale,
        }
    }
}

/// Build the report, oldest snapshot first.
pub fn collect(config: &AppConfig, today: NaiveDate) -> StatusReport {
    let store = SnapshotStore::new(config.data_dir());
    let mut jobs: Vec<Job> = config.jobs.iter().cloned().map(Job::new).collect();
    store.refresh_ordering(&mut jobs);

    let jobs = jobs
        .iter()
        .map(|job| {
            let last_backup = (job.last_backup != EPOCH_LABEL).then(|| job.last_backup.clone());
            let age_days = last_backup
                .as_deref()
                .and_then(parse_label)
                .map(|date| (today - date).num_days());
            JobStatus {
                name: job.name().to_string(),
                last_backup,
                age_days,
                enabled: job.spec.enabled,
                in_progress: store.has_staging(job.name()),
            }
        })
        .collect();

    StatusReport {
        daemon_pid: lock::running_pid(&config.pid_file()),
        jobs,
    }
}

/// Human readable rendering. `color` should only be set for a terminal.
pub fn render(report: &StatusReport, color: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "----- UberBackup Status -----");
    match report.daemon_pid {
        Some(pid) => {
            let _ = writeln!(out, "daemon: running (pid {pid})");
        }
        None => {
            let _ = writeln!(out, "daemon: not running");
        }
    }

    for job in &report.jobs {
        let detail = match (&job.last_backup, job.age_days) {
            (Some(label), Some(days)) => format!("{label} ({days} days ago)"),
            (Some(label), None) => label.clone(),
            (None, _) => "never".to_string(),
        };
        let detail = if color {
            match Staleness::of(job.age_days) {
                Staleness::Fresh => detail.green().to_string(),
                Staleness::Aging => detail.yellow().to_string(),
                Staleness::Stale => detail.red().to_string(),
            }
        } else {
            detail
        };

        let mut flags = String::new();
        if !job.enabled {
            flags.push_str(" [disabled]");
        }
        if job.in_progress {
            flags.push_str(" [in progress]");
        }
        let _ = writeln!(out, "{:<48}: {detail}{flags}", job.name);
    }
    out
}
