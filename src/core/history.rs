//! On-disk snapshot history of every job.
//!
//! Layout under the data directory:
//!
//! ```text
//! data/<job>/<YYYY-MM-DD>   completed, immutable snapshot
//! data/<job>/current        staging area of an unfinished backup
//! ```

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::models::{EPOCH_LABEL, Job, STAGING_DIR, today_label};

/// Read access to the snapshot directories of all jobs.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    data_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn job_dir(&self, job: &str) -> PathBuf {
        self.data_dir.join(job)
    }

    pub fn staging_dir(&self, job: &str) -> PathBuf {
        self.job_dir(job).join(STAGING_DIR)
    }

    pub fn snapshot_dir(&self, job: &str, label: &str) -> PathBuf {
        self.job_dir(job).join(label)
    }

    /// All completed snapshot labels of `job`, oldest first.
    ///
    /// Only directories count and `current` is never included. A job
    /// without a data directory has no snapshots.
    pub fn list_backups(&self, job: &str) -> io::Result<Vec<String>> {
        let dir = self.job_dir(job);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut labels = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                debug!(job, entry = ?entry.file_name(), "Ignoring non UTF-8 entry");
                continue;
            };
            if name != STAGING_DIR {
                labels.push(name);
            }
        }

        labels.sort();
        Ok(labels)
    }

    /// Most recent snapshot label, or the epoch sentinel.
    pub fn last_backup(&self, job: &str) -> String {
        match self.list_backups(job) {
            Ok(mut labels) => labels.pop().unwrap_or_else(|| EPOCH_LABEL.to_string()),
            Err(e) => {
                warn!(job, error = %e, "Failed to list snapshots");
                EPOCH_LABEL.to_string()
            }
        }
    }

    pub fn has_label(&self, job: &str, label: &str) -> bool {
        self.snapshot_dir(job, label).is_dir()
    }

    /// True when a snapshot for the current day already exists.
    pub fn has_today_label(&self, job: &str) -> bool {
        self.has_label(job, &today_label())
    }

    pub fn has_staging(&self, job: &str) -> bool {
        self.staging_dir(job).is_dir()
    }

    /// Recompute every job's `last_backup` from disk and sort the list so
    /// the job with the oldest snapshot comes first. The sort is stable, so
    /// jobs with equal labels keep their relative order.
    pub fn refresh_ordering(&self, jobs: &mut [Job]) {
        for job in jobs.iter_mut() {
            job.last_backup = self.last_backup(job.name());
        }
        jobs.sort_by(|a, b| a.last_backup.cmp(&b.last_backup));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::JobSpec;
    use tempfile::tempdir;

    fn job(name: &str) -> Job {
        Job::new(JobSpec {
            name: name.into(),
            host: "localhost".into(),
            remote_path: "/".into(),
            enabled: true,
            include: vec![],
            exclude: vec![],
        })
    }

    #[test]
    fn test_list_backups_missing_dir_is_empty() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new(temp.path());
        assert!(store.list_backups("nope").unwrap().is_empty());
        assert_eq!(store.last_backup("nope"), EPOCH_LABEL);
    }

    #[test]
    fn test_list_backups_sorted_without_staging() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new(temp.path());
        for name in ["2024-01-03", "current", "2023-12-31", "2024-01-01"] {
            std::fs::create_dir_all(store.job_dir("web").join(name)).unwrap();
        }
        // Plain files are not snapshots
        std::fs::write(store.job_dir("web").join("2024-02-01"), b"x").unwrap();

        let labels = store.list_backups("web").unwrap();
        assert_eq!(labels, vec!["2023-12-31", "2024-01-01", "2024-01-03"]);
        assert_eq!(store.last_backup("web"), "2024-01-03");
        assert!(store.has_staging("web"));
    }

    #[test]
    fn test_has_today_label() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new(temp.path());
        assert!(!store.has_today_label("web"));
        std::fs::create_dir_all(store.snapshot_dir("web", &today_label())).unwrap();
        assert!(store.has_today_label("web"));
    }

    #[test]
    fn test_refresh_ordering_oldest_first_and_stable() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new(temp.path());
        std::fs::create_dir_all(store.snapshot_dir("a", "2024-05-02")).unwrap();
        std::fs::create_dir_all(store.snapshot_dir("b", "2024-05-01")).unwrap();
        std::fs::create_dir_all(store.snapshot_dir("d", "2024-05-01")).unwrap();
        // "c" and "e" have never been backed up

        let mut jobs = vec![job("a"), job("b"), job("c"), job("d"), job("e")];
        store.refresh_ordering(&mut jobs);

        let names: Vec<&str> = jobs.iter().map(|j| j.name()).collect();
        assert_eq!(names, vec!["c", "e", "b", "d", "a"]);
        assert!(
            jobs.windows(2)
                .all(|w| w[0].last_backup <= w[1].last_backup)
        );
    }
}
