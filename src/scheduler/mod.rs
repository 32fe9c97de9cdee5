//! Cron-driven scheduling of backup jobs.
//!
//! [`SchedulerService`] owns the trigger map and a single coordinating task.
//! The task wakes when the earliest trigger is due (or when the map changes),
//! hands due jobs to a bounded worker pool, and goes back to sleep. Runs of
//! the same job never overlap: a trigger that is still running is skipped,
//! and the [`JobRunner`] takes the job's file lock besides.

pub mod cron;
pub mod lock;
pub mod runner;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup::TempWorkspace;
use crate::errors::{BackupError, Result};
use crate::models::{BackupJobConfig, JobId};

pub use cron::{CronField, CronTrigger};
pub use lock::{InstanceLock, JobLock, LockAttempt, LockManager};
pub use runner::{JobRunner, RunReport, RunnerSettings, SkipReason};

/// Longest the coordinator sleeps without re-checking the trigger map.
const MAX_IDLE: Duration = Duration::from_secs(60);

pub fn trigger_id(job_id: JobId) -> String {
    format!("backup_job_{}", job_id)
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_pool_size: usize,
    /// A missed firing later than this is dropped instead of run late.
    pub misfire_grace: chrono::Duration,
    /// Age after which leftover lock files and workspaces are cleared at start.
    pub stale_after: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 5,
            misfire_grace: chrono::Duration::seconds(300),
            stale_after: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    NotInitialized,
    Running,
    Paused,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::NotInitialized => "not_initialized",
            SchedulerState::Running => "running",
            SchedulerState::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub job_count: usize,
    pub jobs: Vec<String>,
    pub next_runs: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJobInfo {
    pub id: String,
    pub job_id: JobId,
    pub next_run: String,
    pub trigger: String,
}

struct Trigger {
    job_name: String,
    cron: CronTrigger,
    next_fire: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
}

/// Clears a trigger's running flag when the worker finishes, however it finishes.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    runner: JobRunner,
    settings: SchedulerSettings,
    triggers: RwLock<BTreeMap<JobId, Trigger>>,
    state: RwLock<SchedulerState>,
    wake: Notify,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

pub struct SchedulerService {
    inner: Arc<Inner>,
    instance_lock: Mutex<Option<InstanceLock>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(runner: JobRunner, settings: SchedulerSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        let pool = settings.worker_pool_size.max(1);
        Self {
            inner: Arc::new(Inner {
                runner,
                settings,
                triggers: RwLock::new(BTreeMap::new()),
                state: RwLock::new(SchedulerState::NotInitialized),
                wake: Notify::new(),
                workers: Arc::new(Semaphore::new(pool)),
                shutdown,
            }),
            instance_lock: Mutex::new(None),
            coordinator: Mutex::new(None),
        }
    }

    pub fn runner(&self) -> &JobRunner {
        &self.inner.runner
    }

    /// Takes the host-wide instance lock, clears leftovers of crashed runs,
    /// installs a trigger per active job and starts dispatching.
    pub async fn start(&self, workspace_root: &std::path::Path) -> Result<usize> {
        let mut instance = self.instance_lock.lock().await;
        if instance.is_some() {
            return Err(BackupError::Scheduler("Scheduler already started".into()));
        }
        let locks = self.inner.runner.locks();
        let lock = locks.acquire_instance()?.ok_or_else(|| {
            BackupError::Scheduler(format!(
                "Another scheduler instance is already running (lock in {})",
                locks.dir().display()
            ))
        })?;
        *instance = Some(lock);

        let cleared = locks.clear_stale(self.inner.settings.stale_after);
        if cleared > 0 {
            info!(cleared, "Cleared stale job locks");
        }
        let swept = TempWorkspace::sweep_stale(workspace_root, self.inner.settings.stale_after);
        if swept > 0 {
            info!(swept, "Removed stale job workspaces");
        }

        let scheduled = match self.reschedule_all().await {
            Ok(scheduled) => scheduled,
            Err(e) => {
                instance.take();
                return Err(e);
            }
        };
        *self.inner.state.write().await = SchedulerState::Running;

        let inner = self.inner.clone();
        let shutdown_rx = self.inner.shutdown.subscribe();
        *self.coordinator.lock().await = Some(tokio::spawn(coordinate(inner, shutdown_rx)));

        info!(jobs = scheduled, workers = self.inner.settings.worker_pool_size, "Scheduler started");
        Ok(scheduled)
    }

    /// Installs (or re-installs) the job's trigger. An inactive job only has
    /// its trigger removed.
    pub async fn schedule_job(&self, job: &BackupJobConfig) -> Result<()> {
        let mut triggers = self.inner.triggers.write().await;
        let previous = triggers.remove(&job.id);
        if !job.is_active {
            debug!(job_id = job.id, "Job inactive, not scheduling");
            return Ok(());
        }

        let running = previous.map(|t| t.running).unwrap_or_default();
        install(&mut triggers, job, running, Utc::now())?;
        drop(triggers);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Removes the job's trigger. Returns `false` if there was none.
    pub async fn unschedule_job(&self, job_id: JobId) -> bool {
        let removed = self.inner.triggers.write().await.remove(&job_id).is_some();
        if removed {
            info!(job_id, "Unscheduled backup job");
        }
        removed
    }

    /// Replaces every trigger with one per currently active job. Jobs whose
    /// schedule does not parse are logged and left out.
    pub async fn reschedule_all(&self) -> Result<usize> {
        let jobs = self.inner.runner.config_store().active_jobs().await?;
        let now = Utc::now();

        let mut triggers = self.inner.triggers.write().await;
        let previous = std::mem::take(&mut *triggers);
        for job in &jobs {
            let running = previous
                .get(&job.id)
                .map(|t| t.running.clone())
                .unwrap_or_default();
            if let Err(e) = install(&mut triggers, job, running, now) {
                error!(job_id = job.id, error = %e, "Failed to schedule job");
            }
        }
        let count = triggers.len();
        drop(triggers);

        self.inner.wake.notify_one();
        info!(count, "Rescheduled all jobs");
        Ok(count)
    }

    pub async fn pause(&self) {
        let mut state = self.inner.state.write().await;
        if *state == SchedulerState::Running {
            *state = SchedulerState::Paused;
            info!("Scheduler paused");
        }
    }

    pub async fn resume(&self) {
        let mut state = self.inner.state.write().await;
        if *state == SchedulerState::Paused {
            *state = SchedulerState::Running;
            drop(state);
            self.inner.wake.notify_one();
            info!("Scheduler resumed");
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = *self.inner.state.read().await;
        let jobs = self.list_scheduled_jobs().await;
        SchedulerStatus {
            state,
            job_count: jobs.len(),
            next_runs: jobs.iter().map(|j| (j.id.clone(), j.next_run.clone())).collect(),
            jobs: jobs.into_iter().map(|j| j.id).collect(),
        }
    }

    pub async fn list_scheduled_jobs(&self) -> Vec<ScheduledJobInfo> {
        self.inner
            .triggers
            .read()
            .await
            .iter()
            .map(|(job_id, trigger)| ScheduledJobInfo {
                id: trigger_id(*job_id),
                job_id: *job_id,
                next_run: format_next_run(trigger.next_fire),
                trigger: trigger.cron.describe(),
            })
            .collect()
    }

    /// Runs the job immediately, outside its schedule. The job lock still applies.
    pub async fn run_job_now(&self, job_id: JobId) -> RunReport {
        info!(job_id, "Manual run requested");
        self.inner.runner.execute(job_id).await
    }

    /// Stops dispatching, waits for in-flight runs and releases the instance lock.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        if let Some(handle) = self.coordinator.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }

        let pool = self.inner.settings.worker_pool_size.max(1) as u32;
        match self.inner.workers.acquire_many(pool).await {
            Ok(permits) => drop(permits),
            Err(e) => warn!(error = %e, "Worker pool closed"),
        }

        *self.inner.state.write().await = SchedulerState::NotInitialized;
        self.instance_lock.lock().await.take();
        info!("Scheduler stopped");
    }

    #[cfg(test)]
    async fn set_state(&self, state: SchedulerState) {
        *self.inner.state.write().await = state;
    }
}

fn install(
    triggers: &mut BTreeMap<JobId, Trigger>,
    job: &BackupJobConfig,
    running: Arc<AtomicBool>,
    now: DateTime<Utc>,
) -> Result<()> {
    let expression = job.cron_expression();
    let cron = CronTrigger::parse(&expression)
        .map_err(|e| BackupError::config(format!("Job {} ({}): {}", job.id, job.name, e)))?;
    let next_fire = cron.next_fire_after(now);
    info!(
        job_id = job.id,
        cron = %expression,
        trigger = %cron.describe(),
        next_run = %format_next_run(next_fire),
        "Scheduled backup job"
    );
    triggers.insert(
        job.id,
        Trigger {
            job_name: job.name.clone(),
            cron,
            next_fire,
            running,
        },
    );
    Ok(())
}

fn format_next_run(next: Option<DateTime<Utc>>) -> String {
    next.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "Not scheduled".to_string())
}

async fn coordinate(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        inner.dispatch_due(Utc::now()).await;

        let wait = inner
            .next_wake(Utc::now())
            .await
            .map_or(MAX_IDLE, |d| d.min(MAX_IDLE));
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("Scheduler coordinator stopped");
}

impl Inner {
    /// Time until the earliest trigger is due, `None` when nothing is scheduled
    /// or dispatching is paused.
    async fn next_wake(&self, now: DateTime<Utc>) -> Option<Duration> {
        if *self.state.read().await != SchedulerState::Running {
            return None;
        }
        self.triggers
            .read()
            .await
            .values()
            .filter_map(|t| t.next_fire)
            .min()
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Hands every due trigger to the worker pool. Missed firings collapse
    /// into one run, or none if later than the misfire grace.
    async fn dispatch_due(&self, now: DateTime<Utc>) -> Vec<JoinHandle<RunReport>> {
        if *self.state.read().await != SchedulerState::Running {
            return Vec::new();
        }

        let mut due = Vec::new();
        {
            let mut triggers = self.triggers.write().await;
            for (job_id, trigger) in triggers.iter_mut() {
                let Some(scheduled) = trigger.next_fire else {
                    continue;
                };
                if scheduled > now {
                    continue;
                }
                // Coalesce: only the latest missed firing counts.
                let mut latest = scheduled;
                while let Some(next) = trigger.cron.next_fire_after(latest).filter(|t| *t <= now) {
                    latest = next;
                }
                trigger.next_fire = trigger.cron.next_fire_after(now);

                let late = now - latest;
                if late > self.settings.misfire_grace {
                    warn!(job_id = *job_id, job = %trigger.job_name, missed_by = %late, "Run time of job was missed, skipping");
                    continue;
                }
                if trigger.running.swap(true, Ordering::SeqCst) {
                    warn!(job_id = *job_id, job = %trigger.job_name, "Previous run still in progress, skipping (max instances 1)");
                    continue;
                }
                due.push((*job_id, RunningFlag(trigger.running.clone())));
            }
        }

        due.into_iter()
            .map(|(job_id, flag)| {
                let runner = self.runner.clone();
                let workers = self.workers.clone();
                tokio::spawn(async move {
                    let _flag = flag;
                    let _permit = match workers.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return RunReport::Skipped(SkipReason::Unavailable("worker pool closed".into())),
                    };
                    runner.execute(job_id).await
                })
            })
            .collect()
    }
}
