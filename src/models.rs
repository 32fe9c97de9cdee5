//! Configuration records and run history records.
//!
//! The records are owned by an external configuration store; this crate only
//! reads them. Run records are written by the job runner through the history
//! store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::backup::schedule_folder;
use crate::errors::{BackupError, Result};

pub type JobId = i64;
pub type ServerId = i64;
pub type StorageId = i64;
pub type RunId = i64;

/// How often a job runs. Also the unit of its retention count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }

    /// Subfolder name under the job's base folder, e.g. `Daily`.
    pub fn folder_name(&self) -> &'static str {
        match self {
            Cadence::Daily => "Daily",
            Cadence::Weekly => "Weekly",
            Cadence::Monthly => "Monthly",
        }
    }

    /// One retention unit. Months are a flat 30 days, not calendar months.
    pub fn retention_period(&self) -> Duration {
        match self {
            Cadence::Daily => Duration::days(1),
            Cadence::Weekly => Duration::weeks(1),
            Cadence::Monthly => Duration::days(30),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Cadence::Daily),
            "weekly" => Ok(Cadence::Weekly),
            "monthly" => Ok(Cadence::Monthly),
            other => Err(BackupError::config(format!("Unknown schedule type: {}", other))),
        }
    }
}

/// Time of day as entered on the job form (`HH:MM`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(BackupError::config(format!(
                "Invalid time of day: {:02}:{:02}",
                hour, minute
            )));
        }
        Ok(Self { hour, minute })
    }
}

impl FromStr for TimeOfDay {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let (hour, minute) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| BackupError::config(format!("Invalid time of day '{}', expected HH:MM", s)))?;
        let hour = hour
            .parse()
            .map_err(|_| BackupError::config(format!("Invalid hour in '{}'", s)))?;
        let minute = minute
            .parse()
            .map_err(|_| BackupError::config(format!("Invalid minute in '{}'", s)))?;
        TimeOfDay::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        format!("{:02}:{:02}", value.hour, value.minute)
    }
}

/// The schedule fields of a job. The cron expression is always derived from
/// these, never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub cadence: Cadence,
    #[serde(default)]
    pub time: TimeOfDay,
    /// Day of week for weekly jobs, 0 = Monday through 6 = Sunday.
    #[serde(default)]
    pub weekly_day: Option<u32>,
    /// Day of month for monthly jobs.
    #[serde(default)]
    pub monthly_day: Option<u32>,
}

impl JobSchedule {
    pub fn daily(time: TimeOfDay) -> Self {
        Self {
            cadence: Cadence::Daily,
            time,
            weekly_day: None,
            monthly_day: None,
        }
    }

    pub fn weekly(time: TimeOfDay, day: u32) -> Self {
        Self {
            cadence: Cadence::Weekly,
            time,
            weekly_day: Some(day),
            monthly_day: None,
        }
    }

    pub fn monthly(time: TimeOfDay, day: u32) -> Self {
        Self {
            cadence: Cadence::Monthly,
            time,
            weekly_day: None,
            monthly_day: Some(day),
        }
    }

    /// Five-field cron expression: `minute hour day month day-of-week`.
    pub fn cron_expression(&self) -> String {
        let TimeOfDay { hour, minute } = self.time;
        match self.cadence {
            Cadence::Daily => format!("{} {} * * *", minute, hour),
            Cadence::Weekly => format!("{} {} * * {}", minute, hour, self.weekly_day.unwrap_or(0)),
            Cadence::Monthly => format!("{} {} {} * *", minute, hour, self.monthly_day.unwrap_or(1)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(day) = self.weekly_day {
            if day > 6 {
                return Err(BackupError::config(format!("Weekly day must be 0-6, got {}", day)));
            }
        }
        if let Some(day) = self.monthly_day {
            if !(1..=31).contains(&day) {
                return Err(BackupError::config(format!("Monthly day must be 1-31, got {}", day)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJobConfig {
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub server_id: ServerId,
    pub databases: Vec<String>,
    pub storage_location_id: StorageId,
    pub folder_path: String,
    pub schedule: JobSchedule,
    /// Number of cadence periods to keep.
    pub retention_count: u32,
    #[serde(default)]
    pub notification_email: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl BackupJobConfig {
    pub fn cadence(&self) -> Cadence {
        self.schedule.cadence
    }

    pub fn cron_expression(&self) -> String {
        self.schedule.cron_expression()
    }

    /// `{folder_path}/{Cadence}`, where uploads and retention operate.
    pub fn schedule_folder(&self) -> String {
        schedule_folder(&self.folder_path, self.cadence())
    }

    pub fn validate(&self) -> Result<()> {
        if self.databases.is_empty() {
            return Err(BackupError::config(format!(
                "Job {} ({}) has no databases selected",
                self.id, self.name
            )));
        }
        if let Some(bad) = self.databases.iter().find(|db| !is_valid_database_name(db)) {
            return Err(BackupError::config(format!(
                "Job {} ({}) has an invalid database name: {:?}",
                self.id, self.name, bad
            )));
        }
        self.schedule
            .validate()
            .map_err(|e| BackupError::config(format!("Job {} ({}): {}", self.id, self.name, e)))
    }
}

/// Database names end up in file names and command lines.
pub fn is_valid_database_name(name: &str) -> bool {
    !name.trim().is_empty()
        && !name.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-' && c != '.')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    Mysql,
    Postgres,
}

impl DbEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbEngine::Mysql => "mysql",
            DbEngine::Postgres => "postgres",
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseServerConfig {
    pub id: ServerId,
    pub name: String,
    #[serde(alias = "type")]
    pub engine: DbEngine,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DatabaseServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseServerConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Ftp,
    S3,
    Blob,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "local",
            StorageKind::Ftp => "ftp",
            StorageKind::S3 => "s3",
            StorageKind::Blob => "blob",
        }
    }
}

/// A storage location. `config` is interpreted only by the matching backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLocationConfig {
    pub id: StorageId,
    pub name: String,
    #[serde(alias = "type")]
    pub kind: StorageKind,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(BackupError::Store(format!("Unknown run status: {}", other))),
        }
    }
}

/// One row of backup history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub job_id: JobId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub message: Option<String>,
    /// Semicolon-joined backend locators of the uploaded files.
    pub locator: Option<String>,
    pub byte_size: Option<i64>,
}

/// Final values written onto a running record.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub end_time: DateTime<Utc>,
    pub status: RunStatus,
    pub message: String,
    pub locator: Option<String>,
    pub byte_size: u64,
}

impl RunOutcome {
    pub fn success(message: impl Into<String>, locator: String, byte_size: u64) -> Self {
        Self {
            end_time: Utc::now(),
            status: RunStatus::Success,
            message: message.into(),
            locator: Some(locator),
            byte_size,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            end_time: Utc::now(),
            status: RunStatus::Failed,
            message: message.into(),
            locator: None,
            byte_size: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn daily_cron_expression() -> Result<()> {
        let schedule = JobSchedule::daily("02:30".parse()?);
        assert_eq!(schedule.cron_expression(), "30 2 * * *");
        Ok(())
    }

    #[test]
    fn weekly_and_monthly_cron_expressions() -> Result<()> {
        assert_eq!(JobSchedule::weekly("23:05".parse()?, 3).cron_expression(), "5 23 * * 3");
        assert_eq!(JobSchedule::monthly("00:00".parse()?, 15).cron_expression(), "0 0 15 * *");
        Ok(())
    }

    #[test]
    fn missing_weekly_day_defaults_to_zero() {
        let schedule = JobSchedule {
            cadence: Cadence::Weekly,
            time: TimeOfDay::default(),
            weekly_day: None,
            monthly_day: None,
        };
        assert_eq!(schedule.cron_expression(), "0 0 * * 0");
    }

    #[test]
    fn weekly_day_zero_fires_on_monday() -> Result<()> {
        use crate::scheduler::CronTrigger;
        use chrono::{Datelike, TimeZone, Weekday};

        let after = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        for (day, expected) in [(0, Weekday::Mon), (4, Weekday::Fri), (6, Weekday::Sun)] {
            let schedule = JobSchedule::weekly("03:00".parse()?, day);
            let next = CronTrigger::parse(&schedule.cron_expression())?.next_fire_after(after);
            assert_eq!(next.map(|t| t.weekday()), Some(expected), "weekly_day {}", day);
        }
        Ok(())
    }

    #[test]
    fn time_of_day_rejects_out_of_range() {
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("12:60".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn retention_periods() {
        assert_eq!(Cadence::Daily.retention_period(), Duration::days(1));
        assert_eq!(Cadence::Weekly.retention_period(), Duration::days(7));
        assert_eq!(Cadence::Monthly.retention_period(), Duration::days(30));
    }

    #[test]
    fn job_deserializes_from_catalog_json() -> anyhow::Result<()> {
        let job: BackupJobConfig = serde_json::from_value(json!({
            "id": 7,
            "name": "nightly",
            "server_id": 1,
            "databases": ["app", "billing"],
            "storage_location_id": 2,
            "folder_path": "backups",
            "schedule": { "cadence": "daily", "time": "02:30" },
            "retention_count": 7
        }))?;
        assert!(job.is_active);
        assert_eq!(job.cron_expression(), "30 2 * * *");
        assert_eq!(job.schedule_folder(), "backups/Daily");
        job.validate()?;
        Ok(())
    }

    #[test]
    fn job_without_databases_is_invalid() -> anyhow::Result<()> {
        let job: BackupJobConfig = serde_json::from_value(json!({
            "id": 1,
            "name": "empty",
            "server_id": 1,
            "databases": [],
            "storage_location_id": 1,
            "folder_path": "x",
            "schedule": { "cadence": "weekly", "time": "01:00", "weekly_day": 9 },
            "retention_count": 1
        }))?;
        assert!(job.validate().is_err());
        Ok(())
    }

    #[test]
    fn server_debug_hides_password() -> anyhow::Result<()> {
        let server: DatabaseServerConfig = serde_json::from_value(json!({
            "id": 1, "name": "db", "type": "postgres", "host": "localhost",
            "port": 5432, "username": "backup", "password": "hunter2"
        }))?;
        assert_eq!(server.engine, DbEngine::Postgres);
        assert!(!format!("{:?}", server).contains("hunter2"));
        Ok(())
    }
}
