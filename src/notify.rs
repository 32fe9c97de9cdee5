//! Run-completion notifications.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tracing::info;

use crate::errors::Result;
use crate::models::BackupJobConfig;

/// A composed message for a job's notification address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// `None` when the job has no notification address.
    pub fn for_run(job: &BackupJobConfig, success: bool, message: &str, at: DateTime<Local>) -> Option<Self> {
        let to = job
            .notification_email
            .as_deref()
            .map(str::trim)
            .filter(|address| !address.is_empty())?;

        let subject = if success {
            format!("Backup Completed Successfully: {}", job.name)
        } else {
            format!("Backup Failed: {}", job.name)
        };
        let body = format!(
            "Backup Job: {}\nStatus: {}\nTime: {}\n\nDetails:\n{}\n",
            job.name,
            if success { "SUCCESS" } else { "FAILED" },
            at.format("%Y-%m-%d %H:%M:%S"),
            message
        );
        Some(Self {
            to: to.to_string(),
            subject,
            body,
        })
    }
}

/// Delivers run outcomes. Failures are reported to the caller, who logs them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job: &BackupJobConfig, success: bool, message: &str) -> Result<()>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, job: &BackupJobConfig, success: bool, message: &str) -> Result<()> {
        if let Some(notification) = Notification::for_run(job, success, message, Local::now()) {
            info!(
                to = %notification.to,
                subject = %notification.subject,
                body = %notification.body,
                "Backup notification"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobSchedule, TimeOfDay};
    use chrono::TimeZone;

    fn job(email: Option<&str>) -> BackupJobConfig {
        BackupJobConfig {
            id: 1,
            name: "nightly".into(),
            description: None,
            server_id: 1,
            databases: vec!["app".into()],
            storage_location_id: 1,
            folder_path: "backups".into(),
            schedule: JobSchedule::daily(TimeOfDay::default()),
            retention_count: 7,
            notification_email: email.map(str::to_string),
            is_active: true,
        }
    }

    #[test]
    fn subjects_reflect_outcome() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 2, 30, 0).unwrap();
        let ok = Notification::for_run(&job(Some("ops@example.com")), true, "done", at).unwrap();
        assert_eq!(ok.subject, "Backup Completed Successfully: nightly");
        assert!(ok.body.contains("Status: SUCCESS"));
        assert!(ok.body.contains("2024-05-01 02:30:00"));

        let failed = Notification::for_run(&job(Some("ops@example.com")), false, "disk full", at).unwrap();
        assert_eq!(failed.subject, "Backup Failed: nightly");
        assert!(failed.body.contains("Status: FAILED"));
        assert!(failed.body.ends_with("disk full\n"));
    }

    #[test]
    fn no_address_no_notification() {
        let at = Local::now();
        assert!(Notification::for_run(&job(None), true, "x", at).is_none());
        assert!(Notification::for_run(&job(Some("  ")), true, "x", at).is_none());
    }
}
