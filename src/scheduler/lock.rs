//! Advisory file locks (`flock`) keyed by job id, plus the per-host
//! scheduler instance lock.
//!
//! Acquisition never blocks. A held lock is a [`JobLock`] guard; dropping it
//! removes the lock file and releases the lock on every exit path, panics
//! included.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::errors::{BackupError, Result};
use crate::models::JobId;

const INSTANCE_LOCK_FILE: &str = "scheduler.lock";
const JOB_LOCK_PREFIX: &str = "backup_job_";
const JOB_LOCK_SUFFIX: &str = ".lock";
const ACQUIRE_ATTEMPTS: usize = 3;

/// Result of a non-blocking acquisition. `Busy` is an expected outcome.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(JobLock),
    Busy,
}

impl LockAttempt {
    pub fn is_busy(&self) -> bool {
        matches!(self, LockAttempt::Busy)
    }
}

/// Owns the lock directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| BackupError::Lock {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn job_lock_path(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{}{}{}", JOB_LOCK_PREFIX, job_id, JOB_LOCK_SUFFIX))
    }

    pub fn try_acquire(&self, job_id: JobId) -> Result<LockAttempt> {
        let path = self.job_lock_path(job_id);
        match try_lock_path(&path)? {
            Some(file) => {
                debug!(job_id, path = %path.display(), "Acquired job lock");
                Ok(LockAttempt::Acquired(JobLock {
                    _held: HeldLock { file, path },
                }))
            }
            None => {
                debug!(job_id, "Job lock is held elsewhere");
                Ok(LockAttempt::Busy)
            }
        }
    }

    /// `None` when another scheduler process already runs on this host.
    pub fn acquire_instance(&self) -> Result<Option<InstanceLock>> {
        let path = self.dir.join(INSTANCE_LOCK_FILE);
        Ok(try_lock_path(&path)?.map(|file| {
            info!(path = %path.display(), "Acquired scheduler instance lock");
            InstanceLock {
                _held: HeldLock { file, path },
            }
        }))
    }

    /// Removes job lock files older than `max_age` whose lock can be taken,
    /// i.e. that no live process holds. Returns how many were removed.
    pub fn clear_stale(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Cannot scan lock directory");
                return 0;
            }
        };
        let now = SystemTime::now();
        let mut cleared = 0;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.starts_with(JOB_LOCK_PREFIX) && name.ends_with(JOB_LOCK_SUFFIX)) {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age);
            if !stale {
                continue;
            }
            match try_lock_path(&entry.path()) {
                Ok(Some(file)) => {
                    drop(HeldLock {
                        file,
                        path: entry.path(),
                    });
                    info!(file = %name, "Cleared stale lock file");
                    cleared += 1;
                }
                Ok(None) => warn!(file = %name, "Old lock file is still held, leaving it"),
                Err(e) => warn!(file = %name, error = %e, "Failed to inspect stale lock file"),
            }
        }
        cleared
    }
}

/// Exclusive right to run one job. Released on drop.
#[derive(Debug)]
pub struct JobLock {
    _held: HeldLock,
}

/// One scheduler per host. Held for the life of the process.
#[derive(Debug)]
pub struct InstanceLock {
    _held: HeldLock,
}

#[derive(Debug)]
struct HeldLock {
    file: File,
    path: PathBuf,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        // Unlink before unlocking so a waiter never locks a file that is about to vanish.
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
            }
        }
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(path = %self.path.display(), "Released lock");
    }
}

/// Opens (creating if needed) and locks `path` without blocking.
///
/// Returns `None` if another holder has it. After locking, the file is
/// checked to still be the one at `path`; a holder that released in between
/// may have unlinked it.
fn try_lock_path(path: &Path) -> Result<Option<File>> {
    let lock_err = |source: io::Error| BackupError::Lock {
        path: path.display().to_string(),
        source,
    };

    for _ in 0..ACQUIRE_ATTEMPTS {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(lock_err)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(lock_err(err));
        }

        let opened = file.metadata().map_err(lock_err)?;
        let same_file = fs::metadata(path)
            .map(|current| current.dev() == opened.dev() && current.ino() == opened.ino())
            .unwrap_or(false);
        if !same_file {
            // Lost a race with a releasing holder; the lock on an unlinked inode is worthless.
            continue;
        }

        file.set_len(0).map_err(lock_err)?;
        writeln!(file, "{}", std::process::id()).map_err(lock_err)?;
        return Ok(Some(file));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy_until_release() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let locks = LockManager::new(dir.path())?;

        let first = locks.try_acquire(7)?;
        assert!(matches!(first, LockAttempt::Acquired(_)));
        assert!(locks.try_acquire(7)?.is_busy());
        // Other jobs are independent.
        assert!(!locks.try_acquire(8)?.is_busy());

        drop(first);
        assert!(!locks.job_lock_path(7).exists());
        assert!(!locks.try_acquire(7)?.is_busy());
        Ok(())
    }

    #[test]
    fn lock_is_released_when_holder_panics() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let locks = LockManager::new(dir.path())?;
        let inner = locks.clone();

        let result = std::panic::catch_unwind(move || {
            let _guard = inner.try_acquire(3).unwrap();
            panic!("job blew up");
        });
        assert!(result.is_err());
        assert!(!locks.try_acquire(3)?.is_busy());
        Ok(())
    }

    #[test]
    fn instance_lock_is_exclusive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let locks = LockManager::new(dir.path())?;

        let held = locks.acquire_instance()?;
        assert!(held.is_some());
        assert!(locks.acquire_instance()?.is_none());
        drop(held);
        assert!(locks.acquire_instance()?.is_some());
        Ok(())
    }

    #[test]
    fn stale_cleanup_spares_held_and_fresh_locks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let locks = LockManager::new(dir.path())?;

        // Left behind by a crashed process: present but unlocked.
        fs::write(locks.job_lock_path(1), b"4242\n")?;
        let held = locks.try_acquire(2)?;
        fs::write(dir.path().join("unrelated.txt"), b"")?;
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(locks.clear_stale(Duration::from_secs(3600)), 0);
        assert_eq!(locks.clear_stale(Duration::ZERO), 1);
        assert!(!locks.job_lock_path(1).exists());
        assert!(locks.job_lock_path(2).exists());
        assert!(dir.path().join("unrelated.txt").exists());
        drop(held);
        Ok(())
    }
}
