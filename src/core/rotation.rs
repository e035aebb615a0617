//! Retention rotation: brings a job's history into a runnable state before a
//! transfer attempt.
//!
//! `prepare` is re-entrant. An existing `current` directory means a previous
//! attempt did not finish, so it is resumed as-is and nothing is pruned. Only
//! when no staging exists are old snapshots removed and the newest one cloned
//! into `current` as hard links.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid, chown};
use tracing::{debug, info, warn};

use super::history::SnapshotStore;
use crate::error::FsOpError;

/// What `prepare` did to the job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// `current` was already there; the interrupted attempt is resumed.
    Resumed,
    /// No snapshot exists yet; an empty `current` was created.
    Fresh,
    /// Old snapshots were pruned and the newest one cloned into `current`.
    Cloned {
        from: String,
        pruned: Vec<String>,
        stats: CloneStats,
    },
    /// Cloning failed part way. `current` exists but may be incomplete; the
    /// transfer fills in whatever is missing.
    CloneIncomplete { from: String, pruned: Vec<String> },
}

/// Counts of entries created by a hard-link clone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneStats {
    pub directories: u64,
    pub links: u64,
}

/// Enforces the retention limit and prepares staging for one job at a time.
#[derive(Debug, Clone)]
pub struct Rotator {
    store: SnapshotStore,
    max_backups: usize,
}

impl Rotator {
    pub fn new(store: SnapshotStore, max_backups: usize) -> Self {
        Self {
            store,
            max_backups: max_backups.max(1),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Make `data/<job>/current` ready for a transfer.
    ///
    /// Only failing to create the job directory or the staging directory is
    /// an error. Prune and clone failures are logged and the attempt goes on.
    pub fn prepare(&self, job: &str) -> Result<Prepared, FsOpError> {
        info!(job, "Preparing job");

        let job_dir = self.store.job_dir(job);
        fs::create_dir_all(&job_dir).map_err(|source| FsOpError::DataDir {
            path: job_dir.clone(),
            source,
        })?;

        let staging = self.store.staging_dir(job);
        if staging.exists() {
            info!(job, "Found unfinished backup, resuming into current");
            return Ok(Prepared::Resumed);
        }

        let mut labels = self
            .store
            .list_backups(job)
            .map_err(|source| FsOpError::List {
                path: job_dir.clone(),
                source,
            })?;

        // The newest snapshot is the clone source and is pruned last. Older
        // ones go first until there is room for the snapshot this attempt
        // will promote.
        let Some(newest) = labels.pop() else {
            fs::create_dir(&staging).map_err(|source| FsOpError::Staging {
                path: staging.clone(),
                source,
            })?;
            info!(job, "No previous snapshot, starting full backup");
            return Ok(Prepared::Fresh);
        };
        let mut pruned = Vec::new();
        while !labels.is_empty() && labels.len() + 1 >= self.max_backups {
            let oldest = labels.remove(0);
            self.prune(job, &oldest);
            pruned.push(oldest);
        }
        let from = self.store.snapshot_dir(job, &newest);

        info!(job, from = %newest, "Linking snapshot into current");
        match clone_tree(&from, &staging) {
            Ok(stats) => {
                debug!(job, directories = stats.directories, links = stats.links, "Clone complete");
                // With a limit of one even the clone source has to go.
                if labels.len() + 1 >= self.max_backups {
                    self.prune(job, &newest);
                    pruned.push(newest.clone());
                }
                Ok(Prepared::Cloned {
                    from: newest,
                    pruned,
                    stats,
                })
            }
            Err(source) => {
                let err = FsOpError::Clone {
                    from: from.clone(),
                    to: staging.clone(),
                    source,
                };
                warn!(job, error = %err, "Clone failed, transfer will fill the gaps");
                fs::create_dir_all(&staging).map_err(|source| FsOpError::Staging {
                    path: staging.clone(),
                    source,
                })?;
                Ok(Prepared::CloneIncomplete {
                    from: newest,
                    pruned,
                })
            }
        }
    }

    fn prune(&self, job: &str, label: &str) {
        let path = self.store.snapshot_dir(job, label);
        info!(job, snapshot = %label, "Removing snapshot");
        if let Err(source) = fs::remove_dir_all(&path) {
            let err = FsOpError::Prune { path, source };
            warn!(job, error = %err, "Prune failed");
        }
    }
}

/// Recreate the tree at `source` under `destination` with every
/// non-directory entry hard-linked to the original inode.
///
/// Directories are new inodes; their permissions and timestamps are copied
/// from the source, and their ownership too when running as root. Symlinks
/// are linked themselves, never followed. `destination` must not exist.
pub fn clone_tree(source: &Path, destination: &Path) -> io::Result<CloneStats> {
    let mut stats = CloneStats::default();
    let chown_dirs = Uid::effective().is_root();
    clone_dir(source, destination, chown_dirs, &mut stats)?;
    Ok(stats)
}

fn clone_dir(
    source: &Path,
    destination: &Path,
    chown_dirs: bool,
    stats: &mut CloneStats,
) -> io::Result<()> {
    let metadata = fs::symlink_metadata(source)?;
    fs::create_dir(destination)?;
    stats.directories += 1;

    let mut subdirs: Vec<(PathBuf, PathBuf)> = Vec::new();
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            subdirs.push((from, to));
        } else {
            fs::hard_link(&from, &to)?;
            stats.links += 1;
        }
    }

    for (from, to) in subdirs {
        clone_dir(&from, &to, chown_dirs, stats)?;
    }

    // Applied after the children exist so creating them does not bump mtime.
    copy_dir_metadata(destination, &metadata, chown_dirs)
}

fn copy_dir_metadata(destination: &Path, metadata: &Metadata, chown_dirs: bool) -> io::Result<()> {
    if chown_dirs {
        if let Err(e) = chown(
            destination,
            Some(Uid::from_raw(metadata.uid())),
            Some(Gid::from_raw(metadata.gid())),
        ) {
            debug!(path = %destination.display(), error = %e, "Failed to copy directory ownership");
        }
    }
    fs::set_permissions(destination, metadata.permissions())?;

    let atime = filetime::FileTime::from_last_access_time(metadata);
    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    filetime::set_file_times(destination, atime, mtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{PermissionsExt, symlink};
    use tempfile::{TempDir, tempdir};

    fn setup(max_backups: usize) -> (TempDir, Rotator) {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new(temp.path().join("data"));
        (temp, Rotator::new(store, max_backups))
    }

    fn make_snapshot(rotator: &Rotator, job: &str, label: &str) -> PathBuf {
        let dir = rotator.store().snapshot_dir(job, label);
        fs::create_dir_all(dir.join("etc")).unwrap();
        fs::write(dir.join("etc/hosts"), label.as_bytes()).unwrap();
        dir
    }

    #[test]
    fn test_prepare_first_backup_creates_empty_staging() {
        let (_temp, rotator) = setup(3);

        let prepared = rotator.prepare("web").unwrap();

        assert_eq!(prepared, Prepared::Fresh);
        let staging = rotator.store().staging_dir("web");
        assert!(staging.is_dir());
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_prepare_prunes_oldest_then_clones_newest() {
        let (_temp, rotator) = setup(2);
        make_snapshot(&rotator, "web", "2024-01-01");
        make_snapshot(&rotator, "web", "2024-01-02");

        let prepared = rotator.prepare("web").unwrap();

        match prepared {
            Prepared::Cloned { from, pruned, .. } => {
                assert_eq!(from, "2024-01-02");
                assert_eq!(pruned, vec!["2024-01-01"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let store = rotator.store();
        assert_eq!(store.list_backups("web").unwrap(), vec!["2024-01-02"]);
        assert_eq!(
            fs::read(store.staging_dir("web").join("etc/hosts")).unwrap(),
            b"2024-01-02"
        );
    }

    #[test]
    fn test_prepare_keeps_count_within_limit() {
        let (_temp, rotator) = setup(3);
        for day in 1..=6 {
            make_snapshot(&rotator, "web", &format!("2024-01-0{day}"));
        }

        rotator.prepare("web").unwrap();

        let labels = rotator.store().list_backups("web").unwrap();
        assert_eq!(labels, vec!["2024-01-05", "2024-01-06"]);
        assert!(labels.len() <= 3);
    }

    #[test]
    fn test_prepare_limit_of_one_keeps_only_staging() {
        let (_temp, rotator) = setup(1);
        make_snapshot(&rotator, "web", "2024-01-01");
        make_snapshot(&rotator, "web", "2024-01-02");

        rotator.prepare("web").unwrap();

        let store = rotator.store();
        assert!(store.list_backups("web").unwrap().is_empty());
        assert_eq!(
            fs::read(store.staging_dir("web").join("etc/hosts")).unwrap(),
            b"2024-01-02"
        );
    }

    #[test]
    fn test_prepare_resumes_existing_staging_without_pruning() {
        let (_temp, rotator) = setup(1);
        make_snapshot(&rotator, "web", "2024-01-01");
        make_snapshot(&rotator, "web", "2024-01-02");
        let staging = rotator.store().staging_dir("web");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("partial"), b"half").unwrap();

        // Repeated crash-recovery cycles must not touch the history
        for _ in 0..3 {
            assert_eq!(rotator.prepare("web").unwrap(), Prepared::Resumed);
        }

        assert_eq!(
            rotator.store().list_backups("web").unwrap(),
            vec!["2024-01-01", "2024-01-02"]
        );
        assert_eq!(fs::read(staging.join("partial")).unwrap(), b"half");
    }

    #[test]
    fn test_clone_tree_hard_links_files() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("top.txt"), b"top").unwrap();
        fs::write(src.join("a/b/deep.txt"), b"deep").unwrap();
        symlink("top.txt", src.join("link")).unwrap();
        fs::set_permissions(src.join("a"), fs::Permissions::from_mode(0o750)).unwrap();

        let dst = temp.path().join("dst");
        let stats = clone_tree(&src, &dst).unwrap();

        assert_eq!(stats, CloneStats { directories: 3, links: 3 });
        for file in ["top.txt", "a/b/deep.txt"] {
            let a = fs::metadata(src.join(file)).unwrap();
            let b = fs::metadata(dst.join(file)).unwrap();
            assert_eq!(a.ino(), b.ino(), "{file} should share an inode");
        }
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), Path::new("top.txt"));
        let mode = fs::metadata(dst.join("a")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
        assert_ne!(
            fs::metadata(src.join("a")).unwrap().ino(),
            fs::metadata(dst.join("a")).unwrap().ino()
        );
    }

    #[test]
    fn test_clone_tree_refuses_existing_destination() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();

        assert!(clone_tree(&src, &dst).is_err());
    }
}
