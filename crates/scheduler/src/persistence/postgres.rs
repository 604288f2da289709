//! PostgreSQL implementation of TaskQueueStore
//!
//! Production persistence using PostgreSQL with:
//! - Exclusive claiming with `FOR UPDATE SKIP LOCKED`
//! - Age gating evaluated against the database clock
//! - Row-locked result writes that never overwrite a canceled job

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::job::{ExtractedHierarchy, FieldSelection, Job, JobOutcome, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, status, created_at, content_type, master_file_path, \
     master_content_checksum, selection_criteria, task_action, result_file_path, \
     extracted_hierarchy, status_message";

/// PostgreSQL implementation of TaskQueueStore
///
/// Uses a connection pool; every operation checks out a connection for the
/// duration of a single statement or transaction.
///
/// # Example
///
/// ```ignore
/// use reduction_scheduler::PostgresTaskQueueStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/portal").await?;
/// let store = PostgresTaskQueueStore::new(pool);
/// store.run_migrations().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskQueueStore {
    pool: PgPool,
}

impl PostgresTaskQueueStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

#[async_trait]
impl TaskQueueStore for PostgresTaskQueueStore {
    #[instrument(skip(self))]
    async fn claim_ready_jobs(
        &self,
        max_jobs: usize,
        min_age: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        if max_jobs == 0 {
            return Ok(vec![]);
        }

        // The CTE locks the oldest eligible rows, skipping rows another
        // claimer holds, and the UPDATE flips them in the same statement.
        // Age is measured with the database clock so that jobs whose
        // creating transaction may still be open stay invisible.
        let query = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM content_reduction_task
                WHERE status = 'queued'
                  AND created_at < NOW() - ($2::BIGINT * INTERVAL '1 millisecond')
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE content_reduction_task
            SET status = 'reducing',
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&query)
            .bind(max_jobs as i64)
            .bind(min_age.as_millis() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to claim jobs: {}", e);
                StoreError::Database(e.to_string())
            })?;

        // RETURNING does not preserve the CTE ordering
        let mut claimed = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|j| (j.created_at, j.id));

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, outcome), fields(job_id = %outcome.job_id, status = %outcome.status))]
    async fn write_result(&self, outcome: &JobOutcome) -> Result<WriteOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let row = sqlx::query("SELECT status FROM content_reduction_task WHERE id = $1 FOR UPDATE")
            .bind(outcome.job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::JobNotFound(outcome.job_id))?;

        let current = parse_status(&row.get::<String, _>("status"))?;
        if current == JobStatus::Canceled {
            // Dropping the transaction rolls back and releases the lock
            debug!("job canceled externally, result not written");
            return Ok(WriteOutcome::SkippedCanceled);
        }

        let hierarchy = outcome
            .extracted_hierarchy
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE content_reduction_task
            SET status = $2,
                result_file_path = $3,
                extracted_hierarchy = $4,
                status_message = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(outcome.job_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.result_file_path)
        .bind(&hierarchy)
        .bind(&outcome.status_message)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to write job result: {}", e);
            StoreError::Database(e.to_string())
        })?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(WriteOutcome::Applied)
    }

    #[instrument(skip(self, job), fields(content_type = %job.content_type))]
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        let selections = serde_json::to_value(&job.selection_criteria)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let query = format!(
            r#"
            INSERT INTO content_reduction_task
                (id, status, content_type, master_file_path, master_content_checksum,
                 selection_criteria, task_action)
            VALUES ($1, 'queued', $2, $3, $4, $5, $6)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&query)
            .bind(Uuid::now_v7())
            .bind(&job.content_type)
            .bind(&job.master_file_path)
            .bind(&job.master_content_checksum)
            .bind(&selections)
            .bind(job.task_action.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to enqueue job: {}", e);
                StoreError::Database(e.to_string())
            })?;

        job_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM content_reduction_task WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::JobNotFound(job_id))?;

        job_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn cancel_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE content_reduction_task
            SET status = 'canceled', updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'reducing')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Distinguish "not cancelable" from "no such job"
        self.get_job(job_id).await?;
        Ok(false)
    }
}

fn parse_status(s: &str) -> Result<JobStatus, StoreError> {
    s.parse().map_err(StoreError::Serialization)
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let selections: serde_json::Value = row.get("selection_criteria");
    let selection_criteria: Vec<FieldSelection> = serde_json::from_value(selections)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let hierarchy: Option<serde_json::Value> = row.get("extracted_hierarchy");
    let extracted_hierarchy: Option<ExtractedHierarchy> = hierarchy
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let task_action: String = row.get("task_action");
    let created_at: DateTime<Utc> = row.get("created_at");

    Ok(Job {
        id: row.get("id"),
        status: parse_status(&row.get::<String, _>("status"))?,
        created_at,
        content_type: row.get("content_type"),
        master_file_path: row.get("master_file_path"),
        master_content_checksum: row.get("master_content_checksum"),
        selection_criteria,
        task_action: task_action.parse().map_err(StoreError::Serialization)?,
        result_file_path: row.get("result_file_path"),
        extracted_hierarchy,
        status_message: row.get("status_message"),
    })
}
