//! Collaborator interfaces for configuration lookup and run history.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::models::{
    BackupJobConfig, DatabaseServerConfig, JobId, RunId, RunOutcome, RunRecord, ServerId, StorageId,
    StorageLocationConfig,
};

pub use memory::{MemoryStore, MemoryStoreBuilder};
pub use postgres::PgHistoryStore;

/// Read-only view of the job, server and storage records.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn job(&self, id: JobId) -> Result<Option<BackupJobConfig>>;

    async fn server(&self, id: ServerId) -> Result<Option<DatabaseServerConfig>>;

    async fn storage_location(&self, id: StorageId) -> Result<Option<StorageLocationConfig>>;

    async fn active_jobs(&self) -> Result<Vec<BackupJobConfig>>;

    /// Active jobs writing to the same storage location and base folder.
    async fn active_jobs_for_location(
        &self,
        storage_location_id: StorageId,
        folder_path: &str,
    ) -> Result<Vec<BackupJobConfig>> {
        let jobs = self.active_jobs().await?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.storage_location_id == storage_location_id && job.folder_path == folder_path)
            .collect())
    }
}

/// Backup history. Each write touches a single row.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Inserts a `running` record and returns it.
    async fn begin_run(&self, job_id: JobId, start_time: DateTime<Utc>) -> Result<RunRecord>;

    /// Finalizes a `running` record. Records that are already final are left untouched.
    async fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<()>;

    /// Most recent `running` record of the job started at or after `since`.
    async fn running_since(&self, job_id: JobId, since: DateTime<Utc>) -> Result<Option<RunRecord>>;

    /// Records started in `[from, to)`, oldest first. `None` means every job.
    async fn runs_between(
        &self,
        job_id: Option<JobId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>>;

    /// Latest records of the job, newest first.
    async fn recent_runs(&self, job_id: JobId, limit: usize) -> Result<Vec<RunRecord>>;
}
