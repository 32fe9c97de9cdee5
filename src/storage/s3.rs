use chrono::NaiveDateTime;
use tracing::warn;

use super::UploadReceipt;
use crate::backup::DumpFile;
use crate::errors::{BackupError, Result};

/// Placeholder for S3 locations: uploads always fail, retention does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3Storage;

impl S3Storage {
    pub async fn upload(&self, _folder_path: &str, _files: &[DumpFile]) -> Result<UploadReceipt> {
        Err(BackupError::upload("S3 storage not yet implemented"))
    }

    pub async fn delete_older_than(&self, folder_path: &str, database: &str, _cutoff: NaiveDateTime) -> usize {
        warn!(folder = %folder_path, database = %database, "S3 retention not yet implemented");
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_always_fails() {
        let err = S3Storage.upload("backups/Daily", &[]).await.unwrap_err();
        assert!(err.to_string().contains("not yet implemented"));
    }

    #[tokio::test]
    async fn delete_is_a_no_op() {
        let cutoff = chrono::Utc::now().naive_utc();
        assert_eq!(S3Storage.delete_older_than("backups/Daily", "app", cutoff).await, 0);
    }
}
