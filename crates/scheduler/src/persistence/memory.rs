//! In-memory implementation of TaskQueueStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::store::*;
use crate::job::{Job, JobOutcome, JobStatus, NewJob};

/// In-memory implementation of TaskQueueStore
///
/// This is primarily for testing and local runs. Claims happen under a
/// single write lock, which gives the same exclusivity the PostgreSQL
/// implementation gets from `FOR UPDATE SKIP LOCKED`.
///
/// # Example
///
/// ```
/// use reduction_scheduler::InMemoryTaskQueueStore;
///
/// let store = InMemoryTaskQueueStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
pub struct InMemoryTaskQueueStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryTaskQueueStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a job row as-is (for seeding tests with back-dated jobs)
    pub fn insert_job(&self, job: Job) {
        self.jobs.write().insert(job.id, job);
    }

    /// Enqueue a job with an explicit creation time
    pub fn enqueue_at(&self, job: NewJob, created_at: DateTime<Utc>) -> Job {
        let job = job.into_job(Uuid::now_v7(), created_at);
        self.insert_job(job.clone());
        job
    }

    /// Get the number of jobs
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Get the number of jobs with the given status
    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|j| j.status == status)
            .count()
    }
}

impl Default for InMemoryTaskQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueueStore for InMemoryTaskQueueStore {
    async fn claim_ready_jobs(
        &self,
        max_jobs: usize,
        min_age: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        if max_jobs == 0 {
            return Ok(vec![]);
        }

        let min_age = chrono::Duration::from_std(min_age)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let cutoff = Utc::now() - min_age;

        let mut jobs = self.jobs.write();
        let mut eligible: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Queued && j.created_at < cutoff)
            .collect();
        eligible.sort_by_key(|j| (j.created_at, j.id));

        let claimed: Vec<Job> = eligible
            .into_iter()
            .take(max_jobs)
            .map(|job| {
                job.status = JobStatus::Reducing;
                job.clone()
            })
            .collect();

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    async fn write_result(&self, outcome: &JobOutcome) -> Result<WriteOutcome, StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&outcome.job_id)
            .ok_or(StoreError::JobNotFound(outcome.job_id))?;

        if job.status == JobStatus::Canceled {
            return Ok(WriteOutcome::SkippedCanceled);
        }

        job.status = outcome.status;
        job.result_file_path = outcome.result_file_path.clone();
        job.extracted_hierarchy = outcome.extracted_hierarchy.clone();
        job.status_message = Some(outcome.status_message.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        Ok(self.enqueue_at(job, Utc::now()))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;

        match job.status {
            JobStatus::Queued | JobStatus::Reducing => {
                job.status = JobStatus::Canceled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
