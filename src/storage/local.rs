use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{UploadReceipt, is_expired};
use crate::backup::DumpFile;
use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    pub path: PathBuf,
}

/// Copies backups into a directory on this host.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    config: LocalConfig,
}

impl LocalStorage {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    fn target_dir(&self, folder_path: &str) -> PathBuf {
        self.config.path.join(folder_path.trim_start_matches('/'))
    }

    pub async fn upload(&self, folder_path: &str, files: &[DumpFile]) -> Result<UploadReceipt> {
        let target_dir = self.target_dir(folder_path);
        fs::create_dir_all(&target_dir).await.map_err(|e| {
            BackupError::upload(format!("Cannot create {}: {}", target_dir.display(), e))
        })?;

        let mut locators = Vec::with_capacity(files.len());
        let mut total_bytes = 0u64;
        for file in files {
            let target = target_dir.join(&file.filename);
            fs::copy(&file.path, &target).await.map_err(|e| {
                BackupError::upload(format!("Failed to copy {} to {}: {}", file.filename, target.display(), e))
            })?;
            let size = fs::metadata(&target).await?.len();
            debug!(path = %target.display(), bytes = size, "Copied backup file");
            total_bytes += size;
            locators.push(target.display().to_string());
        }

        info!(path = %target_dir.display(), files = files.len(), bytes = total_bytes, "Uploaded backups to local storage");
        Ok(UploadReceipt {
            message: format!("Uploaded {} file(s) to {}", files.len(), target_dir.display()),
            locators,
            total_bytes,
        })
    }

    pub async fn delete_older_than(&self, folder_path: &str, database: &str, cutoff: NaiveDateTime) -> usize {
        let target_dir = self.target_dir(folder_path);
        let mut entries = match fs::read_dir(&target_dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut deleted = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %target_dir.display(), error = %e, "Failed to list backup directory");
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_expired(&name, database, cutoff) != Some(true) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    info!(file = %name, "Deleted old backup");
                    deleted += 1;
                }
                Err(e) => warn!(file = %name, error = %e, "Failed to delete old backup"),
            }
        }
        deleted
    }
}
