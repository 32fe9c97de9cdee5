use chrono::{Days, NaiveDateTime};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::schedule_folder;
use crate::errors::{BackupError, Result};
use crate::models::{Cadence, StorageId};
use crate::storage::StorageBackend;
use crate::store::ConfigStore;

/// `now - retention_count * period`. Months count as 30 days.
pub fn compute_cutoff(cadence: Cadence, retention_count: u32, now: NaiveDateTime) -> NaiveDateTime {
    let days = cadence
        .retention_period()
        .num_days()
        .saturating_mul(i64::from(retention_count));
    now.checked_sub_days(Days::new(days.max(0) as u64))
        .unwrap_or(NaiveDateTime::MIN)
}

/// What one retention pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub jobs_considered: usize,
    pub files_deleted: usize,
}

/// Deletes expired backups at a storage location.
///
/// Retention is applied for every active job that writes to the same storage
/// location and base folder, not only the job that just ran, whatever its
/// cadence. Deletions only happen in the folder of the cadence that ran.
#[derive(Clone)]
pub struct RetentionEngine {
    config: Arc<dyn ConfigStore>,
}

impl RetentionEngine {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self { config }
    }

    pub async fn apply(
        &self,
        backend: &StorageBackend,
        storage_location_id: StorageId,
        base_folder_path: &str,
        cadence: Cadence,
        now: NaiveDateTime,
    ) -> Result<RetentionReport> {
        let jobs = self
            .config
            .active_jobs_for_location(storage_location_id, base_folder_path)
            .await
            .map_err(|e| BackupError::Retention(format!("could not resolve jobs for retention: {}", e)))?;

        let folder = schedule_folder(base_folder_path, cadence);
        let mut report = RetentionReport::default();
        let mut seen: BTreeSet<(String, NaiveDateTime)> = BTreeSet::new();

        for job in &jobs {
            report.jobs_considered += 1;
            // Each job keeps its own cadence's retention, applied to this run's folder.
            let cutoff = compute_cutoff(job.cadence(), job.retention_count, now);
            for database in &job.databases {
                if !seen.insert((database.clone(), cutoff)) {
                    continue;
                }
                let deleted = backend.delete_older_than(&folder, database, cutoff).await;
                if deleted > 0 {
                    info!(job_id = job.id, database = %database, folder = %folder, deleted, cutoff = %cutoff, "Deleted old backups");
                }
                report.files_deleted += deleted;
            }
        }

        if report.jobs_considered == 0 {
            warn!(storage_location_id, folder = %folder, "No active jobs found for retention");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::backup_filename;
    use crate::models::{BackupJobConfig, JobSchedule, StorageKind, StorageLocationConfig, TimeOfDay};
    use crate::store::MemoryStore;
    use chrono::{Duration, NaiveDate};
    use serde_json::json;
    use std::fs;

    fn noon(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    #[test]
    fn cutoff_per_cadence() {
        let now = noon(2024, 6, 30);
        assert_eq!(compute_cutoff(Cadence::Daily, 7, now), now - Duration::days(7));
        assert_eq!(compute_cutoff(Cadence::Weekly, 4, now), now - Duration::weeks(4));
        assert_eq!(compute_cutoff(Cadence::Monthly, 3, now), now - Duration::days(90));
    }

    #[test]
    fn zero_retention_cuts_off_at_now() {
        let now = noon(2024, 6, 30);
        assert_eq!(compute_cutoff(Cadence::Daily, 0, now), now);
    }

    #[test]
    fn huge_retention_saturates() {
        let now = noon(2024, 6, 30);
        assert_eq!(compute_cutoff(Cadence::Monthly, u32::MAX, now), NaiveDateTime::MIN);
    }

    fn job(id: i64, databases: &[&str], retention_count: u32, folder: &str) -> BackupJobConfig {
        job_with(id, databases, retention_count, folder, JobSchedule::daily(TimeOfDay::default()))
    }

    fn job_with(
        id: i64,
        databases: &[&str],
        retention_count: u32,
        folder: &str,
        schedule: JobSchedule,
    ) -> BackupJobConfig {
        BackupJobConfig {
            id,
            name: format!("job-{}", id),
            description: None,
            server_id: 1,
            databases: databases.iter().map(|s| s.to_string()).collect(),
            storage_location_id: 1,
            folder_path: folder.to_string(),
            schedule,
            retention_count,
            notification_email: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn applies_to_every_job_sharing_the_location() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let location = StorageLocationConfig {
            id: 1,
            name: "disk".into(),
            kind: StorageKind::Local,
            config: json!({ "path": root.path() }),
        };
        let daily = root.path().join("backups/Daily");
        fs::create_dir_all(&daily)?;
        for db in ["app", "billing", "other"] {
            for day in [1, 20] {
                let date = NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
                fs::write(daily.join(backup_filename(db, date)), b"x")?;
            }
        }

        let store = MemoryStore::builder()
            .storage_location(location.clone())
            .job(job(1, &["app"], 7, "backups"))
            .job(job(2, &["billing"], 7, "backups"))
            .job(job(3, &["other"], 7, "elsewhere"))
            .build();
        let engine = RetentionEngine::new(Arc::new(store));
        let backend = StorageBackend::from_location(&location)?;

        let report = engine
            .apply(&backend, 1, "backups", Cadence::Daily, noon(2024, 6, 25))
            .await?;

        assert_eq!(report.jobs_considered, 2);
        assert_eq!(report.files_deleted, 2);
        assert!(!daily.join("app_2024-06-01.sql.gz").exists());
        assert!(!daily.join("billing_2024-06-01.sql.gz").exists());
        assert!(daily.join("app_2024-06-20.sql.gz").exists());
        // Different base folder, not ours to clean.
        assert!(daily.join("other_2024-06-01.sql.gz").exists());
        Ok(())
    }

    #[tokio::test]
    async fn jobs_of_other_cadences_prune_with_their_own_period() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let location = StorageLocationConfig {
            id: 1,
            name: "disk".into(),
            kind: StorageKind::Local,
            config: json!({ "path": root.path() }),
        };
        let daily = root.path().join("backups/Daily");
        let weekly = root.path().join("backups/Weekly");
        fs::create_dir_all(&daily)?;
        fs::create_dir_all(&weekly)?;
        let ten_days_ago = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        for db in ["app", "reports"] {
            fs::write(daily.join(backup_filename(db, ten_days_ago)), b"x")?;
            fs::write(weekly.join(backup_filename(db, ten_days_ago)), b"x")?;
        }

        // Daily keeps app for 30 days; weekly keeps reports for 1 week.
        let store = MemoryStore::builder()
            .storage_location(location.clone())
            .job(job(1, &["app"], 30, "backups"))
            .job(job_with(2, &["reports"], 1, "backups", JobSchedule::weekly(TimeOfDay::default(), 0)))
            .build();
        let engine = RetentionEngine::new(Arc::new(store));
        let backend = StorageBackend::from_location(&location)?;

        let report = engine
            .apply(&backend, 1, "backups", Cadence::Daily, noon(2024, 6, 25))
            .await?;

        assert_eq!(report.jobs_considered, 2);
        assert_eq!(report.files_deleted, 1);
        assert!(daily.join("app_2024-06-15.sql.gz").exists());
        assert!(!daily.join("reports_2024-06-15.sql.gz").exists());
        // Only the folder of the cadence that ran is touched.
        assert!(weekly.join("reports_2024-06-15.sql.gz").exists());
        Ok(())
    }
}
