use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::BackupError;
use crate::models::{BackupJobConfig, DatabaseServerConfig, StorageLocationConfig};
use crate::scheduler::{RunnerSettings, SchedulerSettings};
use crate::store::MemoryStore;

/// Overrides `settings.history_database_url`, so the credentials can live in `.env`.
pub const HISTORY_DATABASE_URL_ENV: &str = "BACKUP_HISTORY_DATABASE_URL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub lock_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub worker_pool_size: usize,
    pub misfire_grace_seconds: u64,
    pub running_guard_minutes: u32,
    pub stale_lock_hours: u64,
    /// Postgres URL for run history. In-memory history when absent.
    pub history_database_url: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_dir: std::env::temp_dir(),
            workspace_root: PathBuf::from("./tmp"),
            worker_pool_size: 5,
            misfire_grace_seconds: 300,
            running_guard_minutes: 60,
            stale_lock_hours: 24,
            history_database_url: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            worker_pool_size: self.worker_pool_size,
            misfire_grace: chrono::Duration::seconds(self.misfire_grace_seconds.min(i64::MAX as u64) as i64),
            stale_after: Duration::from_secs(self.stale_lock_hours.saturating_mul(3600)),
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            workspace_root: self.workspace_root.clone(),
            running_guard: chrono::Duration::minutes(i64::from(self.running_guard_minutes)),
        }
    }
}

/// Contents of `config.json`: settings plus the job catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub servers: Vec<DatabaseServerConfig>,
    #[serde(default)]
    pub storage_locations: Vec<StorageLocationConfig>,
    #[serde(default)]
    pub jobs: Vec<BackupJobConfig>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let mut config = Self::from_json_str(&config_content).with_context(|| {
            format!("Invalid configuration in {}", config_path.display())
        })?;

        if let Ok(url) = std::env::var(HISTORY_DATABASE_URL_ENV) {
            if !url.trim().is_empty() {
                config.settings.history_database_url = Some(url);
            }
        }
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(content).context("Failed to parse JSON configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the catalog for duplicate ids, dangling references and invalid jobs.
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.settings.worker_pool_size == 0 {
            return Err(BackupError::config("settings.worker_pool_size must be at least 1"));
        }
        let server_ids = unique_ids("server", self.servers.iter().map(|s| s.id))?;
        let storage_ids = unique_ids("storage location", self.storage_locations.iter().map(|s| s.id))?;
        unique_ids("job", self.jobs.iter().map(|j| j.id))?;

        for job in &self.jobs {
            job.validate()?;
            if !server_ids.contains(&job.server_id) {
                return Err(BackupError::config(format!(
                    "Job {} ({}) references unknown server {}",
                    job.id, job.name, job.server_id
                )));
            }
            if !storage_ids.contains(&job.storage_location_id) {
                return Err(BackupError::config(format!(
                    "Job {} ({}) references unknown storage location {}",
                    job.id, job.name, job.storage_location_id
                )));
            }
        }
        Ok(())
    }

    /// Catalog store backed by this configuration.
    pub fn memory_store(&self) -> MemoryStore {
        let mut builder = MemoryStore::builder();
        for server in &self.servers {
            builder = builder.server(server.clone());
        }
        for location in &self.storage_locations {
            builder = builder.storage_location(location.clone());
        }
        for job in &self.jobs {
            builder = builder.job(job.clone());
        }
        builder.build()
    }
}

fn unique_ids(kind: &str, ids: impl Iterator<Item = i64>) -> crate::errors::Result<BTreeSet<i64>> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(BackupError::config(format!("Duplicate {} id {}", kind, id)));
        }
    }
    Ok(seen)
}
