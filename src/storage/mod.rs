//! Storage backends that backup files are uploaded to.
//!
//! A backend is built once per run from a [`StorageLocationConfig`] and offers
//! exactly two operations: uploading a set of dump files into a folder, and
//! deleting a database's backups older than a cutoff. New backends are added
//! as new variants of [`StorageBackend`].

pub mod blob;
pub mod ftp;
pub mod local;
pub mod s3;

use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::backup::{DumpFile, parse_backup_date};
use crate::errors::{BackupError, Result};
use crate::models::{StorageKind, StorageLocationConfig};

pub use blob::{BlobConfig, BlobStorage};
pub use ftp::{FtpConfig, FtpStorage};
pub use local::{LocalConfig, LocalStorage};
pub use s3::S3Storage;

/// What a successful upload produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub message: String,
    /// One backend-specific locator per uploaded file.
    pub locators: Vec<String>,
    pub total_bytes: u64,
}

impl UploadReceipt {
    /// Locators joined with `;`, as stored on the run record.
    pub fn locator(&self) -> String {
        self.locators.join(";")
    }
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Local(LocalStorage),
    Ftp(FtpStorage),
    Blob(BlobStorage),
    S3(S3Storage),
}

impl StorageBackend {
    /// Interprets the location's kind-specific configuration.
    pub fn from_location(location: &StorageLocationConfig) -> Result<Self> {
        let backend = match location.kind {
            StorageKind::Local => StorageBackend::Local(LocalStorage::new(parse_config(location)?)),
            StorageKind::Ftp => StorageBackend::Ftp(FtpStorage::new(parse_config(location)?)?),
            StorageKind::Blob => StorageBackend::Blob(BlobStorage::new(parse_config(location)?)?),
            StorageKind::S3 => StorageBackend::S3(S3Storage),
        };
        Ok(backend)
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            StorageBackend::Local(_) => StorageKind::Local,
            StorageBackend::Ftp(_) => StorageKind::Ftp,
            StorageBackend::Blob(_) => StorageKind::Blob,
            StorageBackend::S3(_) => StorageKind::S3,
        }
    }

    /// Uploads every file into `folder_path`. Any single failure fails the
    /// whole upload.
    pub async fn upload(&self, folder_path: &str, files: &[DumpFile]) -> Result<UploadReceipt> {
        info!(backend = self.kind().as_str(), folder = folder_path, files = files.len(), "Uploading backup files");
        match self {
            StorageBackend::Local(backend) => backend.upload(folder_path, files).await,
            StorageBackend::Ftp(backend) => backend.upload(folder_path, files).await,
            StorageBackend::Blob(backend) => backend.upload(folder_path, files).await,
            StorageBackend::S3(backend) => backend.upload(folder_path, files).await,
        }
    }

    /// Deletes `{database}_{date}.sql.gz` files in `folder_path` dated
    /// strictly before `cutoff`. Individual failures are logged, never fatal.
    pub async fn delete_older_than(&self, folder_path: &str, database: &str, cutoff: NaiveDateTime) -> usize {
        match self {
            StorageBackend::Local(backend) => backend.delete_older_than(folder_path, database, cutoff).await,
            StorageBackend::Ftp(backend) => backend.delete_older_than(folder_path, database, cutoff).await,
            StorageBackend::Blob(backend) => backend.delete_older_than(folder_path, database, cutoff).await,
            StorageBackend::S3(backend) => backend.delete_older_than(folder_path, database, cutoff).await,
        }
    }
}

fn parse_config<T: DeserializeOwned>(location: &StorageLocationConfig) -> Result<T> {
    serde_json::from_value(location.config.clone()).map_err(|e| {
        BackupError::config(format!(
            "Invalid {} configuration for storage location {} ({}): {}",
            location.kind.as_str(),
            location.id,
            location.name,
            e
        ))
    })
}

/// `Some(true)` if `filename` is a backup of `database` dated before `cutoff`,
/// `Some(false)` if it is one but still fresh, `None` if it is not a
/// well-formed backup name of `database`.
pub(crate) fn is_expired(filename: &str, database: &str, cutoff: NaiveDateTime) -> Option<bool> {
    let date = parse_backup_date(filename, database)?;
    Some(date.and_time(chrono::NaiveTime::MIN) < cutoff)
}
