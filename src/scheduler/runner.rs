//! One execution of a backup job.
//!
//! lock → load job → history guard → `running` record → dump → upload →
//! retention → final record → notification. The lock and the workspace are
//! guards, so both are released whichever stage the run stops at.

use chrono::{Duration, Local, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};

use super::lock::{LockAttempt, LockManager};
use crate::backup::{Dumper, RetentionEngine, TempWorkspace};
use crate::errors::{BackupError, Result};
use crate::models::{BackupJobConfig, JobId, RunId, RunOutcome, RunRecord};
use crate::notify::Notifier;
use crate::storage::{StorageBackend, UploadReceipt};
use crate::store::{ConfigStore, HistoryStore};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub workspace_root: PathBuf,
    /// A `running` record younger than this blocks a new run.
    pub running_guard: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./tmp"),
            running_guard: Duration::minutes(60),
        }
    }
}

/// Why a triggered run did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    LockBusy,
    JobMissing,
    JobInactive,
    AlreadyRunning { run_id: RunId },
    /// Lock directory or a store could not be used.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunReport {
    Skipped(SkipReason),
    Completed(RunRecord),
}

/// Collaborators are injected once; a runner is cheap to clone.
#[derive(Clone)]
pub struct JobRunner {
    config: Arc<dyn ConfigStore>,
    history: Arc<dyn HistoryStore>,
    dumper: Arc<dyn Dumper>,
    notifier: Arc<dyn Notifier>,
    locks: LockManager,
    retention: RetentionEngine,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        history: Arc<dyn HistoryStore>,
        dumper: Arc<dyn Dumper>,
        notifier: Arc<dyn Notifier>,
        locks: LockManager,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            retention: RetentionEngine::new(config.clone()),
            config,
            history,
            dumper,
            notifier,
            locks,
            settings,
        }
    }

    pub fn config_store(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    pub fn history_store(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Runs the job once. Never fails: every problem ends up as a skip or a
    /// `failed` record.
    pub async fn execute(&self, job_id: JobId) -> RunReport {
        self.execute_locked(job_id)
            .instrument(info_span!("backup_job", job_id))
            .await
    }

    async fn execute_locked(&self, job_id: JobId) -> RunReport {
        let _lock = match self.locks.try_acquire(job_id) {
            Ok(LockAttempt::Acquired(lock)) => lock,
            Ok(LockAttempt::Busy) => {
                info!("Job already running, skipping");
                return RunReport::Skipped(SkipReason::LockBusy);
            }
            Err(e) => {
                error!(error = %e, "Cannot take job lock");
                return RunReport::Skipped(SkipReason::Unavailable(e.to_string()));
            }
        };

        let job = match self.config.job(job_id).await {
            Ok(Some(job)) if job.is_active => job,
            Ok(Some(_)) => {
                info!("Job is inactive, skipping");
                return RunReport::Skipped(SkipReason::JobInactive);
            }
            Ok(None) => {
                warn!("Job not found, skipping");
                return RunReport::Skipped(SkipReason::JobMissing);
            }
            Err(e) => {
                error!(error = %e, "Cannot load job");
                return RunReport::Skipped(SkipReason::Unavailable(e.to_string()));
            }
        };

        let since = Utc::now() - self.settings.running_guard;
        match self.history.running_since(job_id, since).await {
            Ok(Some(running)) => {
                warn!(run_id = running.id, started = %running.start_time, "Job has a recent running record, skipping");
                return RunReport::Skipped(SkipReason::AlreadyRunning { run_id: running.id });
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Cannot check running history");
                return RunReport::Skipped(SkipReason::Unavailable(e.to_string()));
            }
        }

        let run = match self.history.begin_run(job_id, Utc::now()).await {
            Ok(run) => run,
            Err(e) => {
                error!(error = %e, "Cannot record run start");
                return RunReport::Skipped(SkipReason::Unavailable(e.to_string()));
            }
        };
        info!(job = %job.name, run_id = run.id, "Starting backup job");

        let outcome = self.run_contained(&job).await;
        if outcome.is_success() {
            info!(bytes = outcome.byte_size, "{}", outcome.message);
        } else {
            error!("Backup failed: {}", outcome.message);
        }

        if let Err(e) = self.history.finish_run(run.id, &outcome).await {
            error!(run_id = run.id, error = %e, "Failed to record run outcome");
        }
        if job.notification_email.is_some() {
            if let Err(e) = self.notifier.notify(&job, outcome.is_success(), &outcome.message).await {
                warn!(error = %e, "Failed to send notification");
            }
        }

        RunReport::Completed(RunRecord {
            end_time: Some(outcome.end_time),
            status: outcome.status,
            message: Some(outcome.message),
            locator: outcome.locator,
            byte_size: Some(i64::try_from(outcome.byte_size).unwrap_or(i64::MAX)),
            ..run
        })
    }

    /// Runs the pipeline on its own task so a panic becomes a failed run
    /// instead of taking the caller down.
    async fn run_contained(&self, job: &BackupJobConfig) -> RunOutcome {
        let runner = self.clone();
        let owned = job.clone();
        let task = tokio::spawn(
            async move {
                match runner.run_pipeline(&owned).await {
                    Ok((count, receipt)) => RunOutcome::success(
                        format!("Backup completed: {} database(s). {}", count, receipt.message),
                        receipt.locator(),
                        receipt.total_bytes,
                    ),
                    Err(e) => RunOutcome::failed(e.to_string()),
                }
            }
            .in_current_span(),
        );
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::failed(format!("Critical error: {}", e)),
        }
    }

    async fn run_pipeline(&self, job: &BackupJobConfig) -> Result<(usize, UploadReceipt)> {
        let server = self.config.server(job.server_id).await?.ok_or_else(|| {
            BackupError::config(format!("Database server {} not found", job.server_id))
        })?;
        let location = self
            .config
            .storage_location(job.storage_location_id)
            .await?
            .ok_or_else(|| {
                BackupError::config(format!("Storage location {} not found", job.storage_location_id))
            })?;
        let backend = StorageBackend::from_location(&location)?;

        let workspace = TempWorkspace::create(&self.settings.workspace_root, Some(job.id))?;
        let files = self
            .dumper
            .dump(&server, &job.databases, workspace.path())
            .await?;
        let receipt = backend.upload(&job.schedule_folder(), &files).await?;

        match self
            .retention
            .apply(
                &backend,
                job.storage_location_id,
                &job.folder_path,
                job.cadence(),
                Local::now().naive_local(),
            )
            .await
        {
            Ok(report) => info!(deleted = report.files_deleted, "Retention applied"),
            Err(e) => warn!(error = %e, "Retention failed"),
        }

        if !workspace.cleanup() {
            warn!("Workspace was not fully removed");
        }
        Ok((files.len(), receipt))
    }
}
