//! Job Repository: persistence of `BatchJob` records, backed by Postgres.
//!
//! `insert` enforces the "unique `name` among non-terminal jobs" invariant
//! via a partial unique index (see `migrations/0001_init.sql`); reconciler-
//! and cancel-driven status transitions go through `cas_status`, which only
//! applies if the record's current status is still one the caller expects.

use async_trait::async_trait;
use chrono::Utc;
use job_runner_common::models::job::JobParameters;
use job_runner_common::{BatchJob, BatchStatus};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("a non-terminal job named '{0}' already exists")]
    DuplicateName(String),
    #[error("repository error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fields a reconciler or cancellation transition may set. `None` leaves the
/// column untouched (`COALESCE` in the query).
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: BatchStatus,
    pub start_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub output_file_url: Option<String>,
    pub last_pod_response: Option<serde_json::Value>,
    pub cleanup_launched: Option<bool>,
    pub created_ticks_unseen: Option<i32>,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &BatchJob) -> Result<(), RepoError>;
    async fn get(&self, id: Uuid) -> Result<Option<BatchJob>, RepoError>;
    async fn list(&self, status: Option<BatchStatus>) -> Result<Vec<BatchJob>, RepoError>;
    /// Records with status in `{created, running, cleaning}` — the set the
    /// reconciler loads every tick.
    async fn list_non_terminal(&self) -> Result<Vec<BatchJob>, RepoError>;
    /// Applies `update` only if the record's current status is in
    /// `expected`. Returns whether the update was applied.
    async fn cas_status(
        &self,
        id: Uuid,
        expected: &[BatchStatus],
        update: StatusUpdate,
    ) -> Result<bool, RepoError>;
    /// Strips `job_parameters.input_zip` from the persisted record. Called
    /// once the payload has been uploaded to object storage.
    async fn clear_input_zip(&self, id: Uuid) -> Result<(), RepoError>;
}

pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<BatchJob, RepoError> {
    let status_str: String = row.try_get("status")?;
    let status = BatchStatus::from_str(&status_str).map_err(|e| {
        sqlx::Error::Decode(Box::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            e.to_string(),
        )))
    })?;
    let job_parameters: serde_json::Value = row.try_get("job_parameters")?;
    let job_parameters: JobParameters = serde_json::from_value(job_parameters)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(BatchJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        account_id: row.try_get("account_id")?,
        job_parameters,
        has_input_file: row.try_get("has_input_file")?,
        status,
        created: row.try_get("created")?,
        start_time: row.try_get("start_time")?,
        stop_time: row.try_get("stop_time")?,
        output_file_url: row.try_get("output_file_url")?,
        last_pod_response: row.try_get("last_pod_response")?,
        cleanup_launched: row.try_get("cleanup_launched")?,
        created_ticks_unseen: row.try_get("created_ticks_unseen")?,
    })
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, job: &BatchJob) -> Result<(), RepoError> {
        let job_parameters = serde_json::to_value(&job.job_parameters)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let result = sqlx::query(
            r"
            INSERT INTO batch_jobs
                (id, name, account_id, job_parameters, has_input_file, status, created,
                 start_time, stop_time, output_file_url, last_pod_response, cleanup_launched,
                 created_ticks_unseen)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.account_id)
        .bind(job_parameters)
        .bind(job.has_input_file)
        .bind(job.status.as_str())
        .bind(job.created)
        .bind(job.start_time)
        .bind(job.stop_time)
        .bind(&job.output_file_url)
        .bind(&job.last_pod_response)
        .bind(job.cleanup_launched)
        .bind(job.created_ticks_unseen)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23505") => {
                Err(RepoError::DuplicateName(job.name.clone()))
            }
            Err(e) => Err(RepoError::Database(e)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<BatchJob>, RepoError> {
        let row = sqlx::query("SELECT * FROM batch_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list(&self, status: Option<BatchStatus>) -> Result<Vec<BatchJob>, RepoError> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM batch_jobs WHERE status = $1 ORDER BY created DESC")
                    .bind(s.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM batch_jobs ORDER BY created DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_job).collect()
    }

    async fn list_non_terminal(&self) -> Result<Vec<BatchJob>, RepoError> {
        let rows = sqlx::query(
            "SELECT * FROM batch_jobs WHERE status IN ('created', 'running', 'cleaning')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn cas_status(
        &self,
        id: Uuid,
        expected: &[BatchStatus],
        update: StatusUpdate,
    ) -> Result<bool, RepoError> {
        let expected: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        let result = sqlx::query(
            r"
            UPDATE batch_jobs SET
                status = $1,
                start_time = COALESCE($2, start_time),
                stop_time = COALESCE($3, stop_time),
                output_file_url = COALESCE($4, output_file_url),
                last_pod_response = COALESCE($5, last_pod_response),
                cleanup_launched = COALESCE($6, cleanup_launched),
                created_ticks_unseen = COALESCE($7, created_ticks_unseen)
            WHERE id = $8 AND status = ANY($9)
            ",
        )
        .bind(update.status.as_str())
        .bind(update.start_time)
        .bind(update.stop_time)
        .bind(&update.output_file_url)
        .bind(&update.last_pod_response)
        .bind(update.cleanup_launched)
        .bind(update.created_ticks_unseen)
        .bind(id)
        .bind(&expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_input_zip(&self, id: Uuid) -> Result<(), RepoError> {
        sqlx::query("UPDATE batch_jobs SET job_parameters = job_parameters - 'input_zip' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Epoch-millisecond `now`, shared by every layer that stamps timestamps.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
