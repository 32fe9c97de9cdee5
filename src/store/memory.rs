use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{ConfigStore, HistoryStore};
use crate::errors::{BackupError, Result};
use crate::models::{
    BackupJobConfig, DatabaseServerConfig, JobId, RunId, RunOutcome, RunRecord, RunStatus, ServerId,
    StorageId, StorageLocationConfig,
};

#[derive(Debug, Default)]
struct Catalog {
    servers: BTreeMap<ServerId, DatabaseServerConfig>,
    storage_locations: BTreeMap<StorageId, StorageLocationConfig>,
    jobs: BTreeMap<JobId, BackupJobConfig>,
}

#[derive(Debug, Default)]
struct History {
    next_id: RunId,
    records: Vec<RunRecord>,
}

/// Catalog loaded from the config file, with history kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    catalog: RwLock<Catalog>,
    history: RwLock<History>,
}

impl MemoryStore {
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    /// Every history record, oldest first.
    pub async fn all_runs(&self) -> Vec<RunRecord> {
        self.history.read().await.records.clone()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStoreBuilder {
    catalog: Catalog,
}

impl MemoryStoreBuilder {
    pub fn server(mut self, server: DatabaseServerConfig) -> Self {
        self.catalog.servers.insert(server.id, server);
        self
    }

    pub fn storage_location(mut self, location: StorageLocationConfig) -> Self {
        self.catalog.storage_locations.insert(location.id, location);
        self
    }

    pub fn job(mut self, job: BackupJobConfig) -> Self {
        self.catalog.jobs.insert(job.id, job);
        self
    }

    pub fn build(self) -> MemoryStore {
        MemoryStore {
            catalog: RwLock::new(self.catalog),
            history: RwLock::new(History::default()),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn job(&self, id: JobId) -> Result<Option<BackupJobConfig>> {
        Ok(self.catalog.read().await.jobs.get(&id).cloned())
    }

    async fn server(&self, id: ServerId) -> Result<Option<DatabaseServerConfig>> {
        Ok(self.catalog.read().await.servers.get(&id).cloned())
    }

    async fn storage_location(&self, id: StorageId) -> Result<Option<StorageLocationConfig>> {
        Ok(self.catalog.read().await.storage_locations.get(&id).cloned())
    }

    async fn active_jobs(&self) -> Result<Vec<BackupJobConfig>> {
        Ok(self
            .catalog
            .read()
            .await
            .jobs
            .values()
            .filter(|job| job.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn begin_run(&self, job_id: JobId, start_time: DateTime<Utc>) -> Result<RunRecord> {
        let mut history = self.history.write().await;
        history.next_id += 1;
        let record = RunRecord {
            id: history.next_id,
            job_id,
            start_time,
            end_time: None,
            status: RunStatus::Running,
            message: None,
            locator: None,
            byte_size: None,
        };
        history.records.push(record.clone());
        Ok(record)
    }

    async fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<()> {
        let mut history = self.history.write().await;
        let record = history
            .records
            .iter_mut()
            .find(|record| record.id == run_id)
            .ok_or_else(|| BackupError::Store(format!("Run {} not found", run_id)))?;
        if record.status != RunStatus::Running {
            return Ok(());
        }
        record.end_time = Some(outcome.end_time);
        record.status = outcome.status;
        record.message = Some(outcome.message.clone());
        record.locator = outcome.locator.clone();
        record.byte_size = Some(outcome.byte_size as i64);
        Ok(())
    }

    async fn running_since(&self, job_id: JobId, since: DateTime<Utc>) -> Result<Option<RunRecord>> {
        Ok(self
            .history
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.job_id == job_id && r.status == RunStatus::Running && r.start_time >= since)
            .max_by_key(|r| r.start_time)
            .cloned())
    }

    async fn runs_between(
        &self,
        job_id: Option<JobId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .history
            .read()
            .await
            .records
            .iter()
            .filter(|r| job_id.is_none_or(|id| r.job_id == id) && r.start_time >= from && r.start_time < to)
            .cloned()
            .collect();
        runs.sort_by_key(|r| (r.start_time, r.id));
        Ok(runs)
    }

    async fn recent_runs(&self, job_id: JobId, limit: usize) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .history
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| (b.start_time, b.id).cmp(&(a.start_time, a.id)));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobSchedule, TimeOfDay};
    use chrono::Duration;

    fn job(id: JobId, active: bool, folder: &str) -> BackupJobConfig {
        BackupJobConfig {
            id,
            name: format!("job-{}", id),
            description: None,
            server_id: 1,
            databases: vec!["app".into()],
            storage_location_id: 1,
            folder_path: folder.into(),
            schedule: JobSchedule::daily(TimeOfDay::default()),
            retention_count: 3,
            notification_email: None,
            is_active: active,
        }
    }

    #[tokio::test]
    async fn active_jobs_filter_inactive_and_other_folders() -> Result<()> {
        let store = MemoryStore::builder()
            .job(job(1, true, "backups"))
            .job(job(2, false, "backups"))
            .job(job(3, true, "other"))
            .build();
        assert_eq!(store.active_jobs().await?.len(), 2);
        let shared = store.active_jobs_for_location(1, "backups").await?;
        assert_eq!(shared.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1]);
        Ok(())
    }

    #[tokio::test]
    async fn run_transitions_from_running_to_final_once() -> Result<()> {
        let store = MemoryStore::default();
        let start = Utc::now();
        let run = store.begin_run(7, start).await?;
        assert_eq!(run.status, RunStatus::Running);
        assert!(store.running_since(7, start - Duration::hours(1)).await?.is_some());

        store.finish_run(run.id, &RunOutcome::success("ok", "/x".into(), 10)).await?;
        store.finish_run(run.id, &RunOutcome::failed("late")).await?;

        let runs = store.recent_runs(7, 10).await?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].byte_size, Some(10));
        assert!(store.running_since(7, start - Duration::hours(1)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn old_running_records_are_outside_the_guard_window() -> Result<()> {
        let store = MemoryStore::default();
        let now = Utc::now();
        store.begin_run(1, now - Duration::hours(2)).await?;
        assert!(store.running_since(1, now - Duration::hours(1)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn runs_between_is_half_open_and_optionally_filtered() -> Result<()> {
        let store = MemoryStore::default();
        let t0 = Utc::now();
        store.begin_run(1, t0).await?;
        store.begin_run(2, t0 + Duration::minutes(1)).await?;
        store.begin_run(1, t0 + Duration::minutes(2)).await?;

        assert_eq!(store.runs_between(None, t0, t0 + Duration::minutes(2)).await?.len(), 2);
        assert_eq!(store.runs_between(Some(1), t0, t0 + Duration::minutes(3)).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn finishing_unknown_run_is_a_store_error() {
        let store = MemoryStore::default();
        let result = store.finish_run(99, &RunOutcome::failed("x")).await;
        assert!(matches!(result, Err(BackupError::Store(_))));
    }
}
