use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use super::HistoryStore;
use crate::errors::{BackupError, Result};
use crate::models::{JobId, RunId, RunOutcome, RunRecord, RunStatus};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS backup_history (
    id BIGSERIAL PRIMARY KEY,
    job_id BIGINT NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ,
    status VARCHAR(20) NOT NULL,
    message TEXT,
    backup_path TEXT,
    backup_size BIGINT
)"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS backup_history_job_start_idx ON backup_history (job_id, start_time)";

const COLUMNS: &str = "id, job_id, start_time, end_time, status, message, backup_path, backup_size";

/// Run history in a Postgres `backup_history` table.
#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    /// Connects and makes sure the history table exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        info!("✓ backup_history table ready");
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<RunRecord> {
    let status: String = row.try_get("status")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        status: status.parse()?,
        message: row.try_get("message")?,
        locator: row.try_get("backup_path")?,
        byte_size: row.try_get("backup_size")?,
    })
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn begin_run(&self, job_id: JobId, start_time: DateTime<Utc>) -> Result<RunRecord> {
        let row = sqlx::query(&format!(
            "INSERT INTO backup_history (job_id, start_time, status) VALUES ($1, $2, $3) RETURNING {}",
            COLUMNS
        ))
        .bind(job_id)
        .bind(start_time)
        .bind(RunStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await?;
        record_from_row(&row)
    }

    async fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE backup_history
             SET end_time = $2, status = $3, message = $4, backup_path = $5, backup_size = $6
             WHERE id = $1 AND status = $7",
        )
        .bind(run_id)
        .bind(outcome.end_time)
        .bind(outcome.status.as_str())
        .bind(&outcome.message)
        .bind(&outcome.locator)
        .bind(i64::try_from(outcome.byte_size).unwrap_or(i64::MAX))
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM backup_history WHERE id = $1)")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(BackupError::Store(format!("Run {} not found", run_id)));
            }
        }
        Ok(())
    }

    async fn running_since(&self, job_id: JobId, since: DateTime<Utc>) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM backup_history
             WHERE job_id = $1 AND status = $2 AND start_time >= $3
             ORDER BY start_time DESC LIMIT 1",
            COLUMNS
        ))
        .bind(job_id)
        .bind(RunStatus::Running.as_str())
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn runs_between(
        &self,
        job_id: Option<JobId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM backup_history
             WHERE ($1::BIGINT IS NULL OR job_id = $1) AND start_time >= $2 AND start_time < $3
             ORDER BY start_time, id",
            COLUMNS
        ))
        .bind(job_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn recent_runs(&self, job_id: JobId, limit: usize) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM backup_history WHERE job_id = $1 ORDER BY start_time DESC, id DESC LIMIT $2",
            COLUMNS
        ))
        .bind(job_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }
}
