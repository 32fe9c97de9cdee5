//! Job-scoped scratch directories for dump files.
//!
//! Each run gets its own directory under the workspace root. The directory is
//! removed when the [`TempWorkspace`] is cleaned up or dropped, whichever
//! comes first, so every exit path of a run leaves nothing behind.

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::errors::Result;
use crate::models::JobId;

const DIR_PREFIX: &str = "job_";

#[derive(Debug)]
pub struct TempWorkspace {
    path: PathBuf,
    released: bool,
}

impl TempWorkspace {
    /// Creates `{root}/job_{id}`, or `{root}/job_{timestamp}_{random}` for
    /// ad-hoc runs without a job id.
    pub fn create(root: &Path, job_id: Option<JobId>) -> Result<Self> {
        fs::create_dir_all(root)?;
        let name = match job_id {
            Some(id) => format!("{}{}", DIR_PREFIX, id),
            None => {
                let suffix = Uuid::new_v4().simple().to_string();
                format!(
                    "{}{}_{}",
                    DIR_PREFIX,
                    Local::now().format("%Y%m%d_%H%M%S"),
                    &suffix[..8]
                )
            }
        };
        let path = root.join(name);
        fs::create_dir_all(&path)?;
        debug!(path = %path.display(), "Created job workspace");
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory now. Returns `false` if anything was left behind.
    pub fn cleanup(mut self) -> bool {
        self.released = true;
        remove_workspace_dir(&self.path)
    }

    /// Removes `job_*` directories under `root` last modified more than
    /// `max_age` ago. Returns how many were removed.
    pub fn sweep_stale(root: &Path, max_age: Duration) -> usize {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            let is_job_dir = entry.file_name().to_string_lossy().starts_with(DIR_PREFIX)
                && path.is_dir();
            if !is_job_dir {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if let Some(age) = age.filter(|age| *age > max_age) {
                match fs::remove_dir_all(&path) {
                    Ok(()) => {
                        info!(path = %path.display(), age_hours = age.as_secs() / 3600, "Deleted old job directory");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old job directory"),
                }
            }
        }
        removed
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        if !self.released {
            remove_workspace_dir(&self.path);
        }
    }
}

/// Deletes files first, then subdirectories, then `dir` itself. Failures are
/// logged and skipped; removal of the parent is still attempted.
fn remove_workspace_dir(dir: &Path) -> bool {
    if !dir.exists() {
        return true;
    }
    let mut clean = true;

    for entry in WalkDir::new(dir).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Failed to read workspace entry");
                clean = false;
                continue;
            }
        };
        let path = entry.path();
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => debug!(path = %path.display(), "Deleted workspace entry"),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete workspace entry");
                clean = false;
            }
        }
    }

    match fs::remove_dir(dir) {
        Ok(()) => {
            debug!(path = %dir.display(), "Cleaned up job workspace");
            clean
        }
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Could not remove job workspace (may not be empty)");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_workspace_is_keyed_by_job_id() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let ws = TempWorkspace::create(root.path(), Some(42))?;
        assert_eq!(ws.path(), root.path().join("job_42"));
        assert!(ws.path().is_dir());
        Ok(())
    }

    #[test]
    fn ad_hoc_workspaces_do_not_collide() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let a = TempWorkspace::create(root.path(), None)?;
        let b = TempWorkspace::create(root.path(), None)?;
        assert_ne!(a.path(), b.path());
        Ok(())
    }

    #[test]
    fn cleanup_removes_nested_content() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let ws = TempWorkspace::create(root.path(), Some(1))?;
        let path = ws.path().to_path_buf();
        fs::write(path.join("app_2024-01-01.sql.gz"), b"data")?;
        fs::create_dir_all(path.join("nested/deeper"))?;
        fs::write(path.join("nested/deeper/file"), b"x")?;

        assert!(ws.cleanup());
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn drop_removes_directory() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let path = {
            let ws = TempWorkspace::create(root.path(), Some(5))?;
            fs::write(ws.path().join("partial.sql.gz"), b"")?;
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn cleanup_of_missing_directory_is_fine() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let ws = TempWorkspace::create(root.path(), Some(9))?;
        fs::remove_dir(ws.path())?;
        assert!(ws.cleanup());
        Ok(())
    }

    #[test]
    fn sweep_skips_fresh_and_foreign_directories() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        fs::create_dir(root.path().join("job_fresh"))?;
        fs::create_dir(root.path().join("keepme"))?;

        assert_eq!(TempWorkspace::sweep_stale(root.path(), Duration::from_secs(3600)), 0);
        // Zero max age: every job_ directory is stale.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(TempWorkspace::sweep_stale(root.path(), Duration::ZERO), 1);
        assert!(root.path().join("keepme").exists());
        Ok(())
    }
}
