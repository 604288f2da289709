//! TaskQueueStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::job::{Job, JobOutcome, NewJob};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of writing a job outcome back to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The outcome was persisted
    Applied,
    /// The row had already been canceled; nothing was written
    SkippedCanceled,
}

/// Durable queue of reduction jobs
///
/// Implementations must be thread-safe and support concurrent access from
/// multiple pollers and multiple processes. Each call is one logical
/// operation; no connection or transaction outlives a call.
#[async_trait]
pub trait TaskQueueStore: Send + Sync + 'static {
    // =========================================================================
    // Scheduler Operations
    // =========================================================================

    /// Claim up to `max_jobs` queued jobs older than `min_age`
    ///
    /// In one atomic step, selects the oldest eligible `queued` rows, marks
    /// them `reducing` and returns them ordered oldest-first. Two concurrent
    /// callers never receive the same row.
    async fn claim_ready_jobs(
        &self,
        max_jobs: usize,
        min_age: Duration,
    ) -> Result<Vec<Job>, StoreError>;

    /// Persist a job outcome unless the row has been canceled
    async fn write_result(&self, outcome: &JobOutcome) -> Result<WriteOutcome, StoreError>;

    // =========================================================================
    // Queue Maintenance (used by submitters and operators)
    // =========================================================================

    /// Enqueue a new job in `queued` status
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Load one job
    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError>;

    /// Mark a job canceled unless it already completed successfully
    ///
    /// Returns whether the row was changed.
    async fn cancel_job(&self, job_id: Uuid) -> Result<bool, StoreError>;
}
