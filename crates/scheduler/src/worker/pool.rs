//! Bounded set of in-flight job executions
//!
//! Owned by exactly one poller. Each admitted job runs on its own tokio task
//! with its own cancellation token; jobs report back only by completing.

use std::fmt;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};
use uuid::Uuid;

use crate::job::{Job, JobOutcome};
use crate::pipeline::{JobContext, RunnerRegistry};

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// A job was admitted while every slot was taken
    #[error("worker pool is full ({capacity} running)")]
    CapacityExceeded { capacity: usize },
}

struct RunningJob {
    job_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<JobOutcome>,
}

/// In-flight jobs of one poller
pub struct WorkerPool {
    capacity: usize,
    registry: RunnerRegistry,
    running: Vec<RunningJob>,
}

impl WorkerPool {
    /// Create a pool running at most `capacity` jobs at once
    pub fn new(capacity: usize, registry: RunnerRegistry) -> Self {
        Self {
            capacity,
            registry,
            running: Vec::with_capacity(capacity),
        }
    }

    /// Start executing a claimed job
    ///
    /// A job whose content type has no runner completes immediately with an
    /// `Error` outcome.
    pub fn admit(&mut self, job: Job) -> Result<(), WorkerPoolError> {
        if self.running.len() >= self.capacity {
            return Err(WorkerPoolError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let job_id = job.id;
        let cancel = CancellationToken::new();
        let span = tracing::info_span!("job", %job_id, content_type = %job.content_type);

        let handle = match self.registry.get(&job.content_type) {
            Some(runner) => {
                let ctx = JobContext::new(job, cancel.clone());
                tokio::spawn(async move { runner.execute(ctx).await }.instrument(span))
            }
            None => {
                let outcome = JobOutcome::error(
                    job_id,
                    format!("no runner registered for content type '{}'", job.content_type),
                );
                tokio::spawn(async move { outcome })
            }
        };

        info!(%job_id, running = self.running.len() + 1, "job admitted");
        self.running.push(RunningJob {
            job_id,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Remove finished jobs and return their outcomes
    ///
    /// A job that panicked is reported as an `Error` outcome.
    pub async fn reap_completed(&mut self) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        let mut index = 0;
        while index < self.running.len() {
            if !self.running[index].handle.is_finished() {
                index += 1;
                continue;
            }

            let finished = self.running.swap_remove(index);
            let outcome = match finished.handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job_id = %finished.job_id, error = %e, "job task failed");
                    JobOutcome::error(finished.job_id, format!("job execution aborted: {e}"))
                }
            };
            debug!(job_id = %finished.job_id, status = %outcome.status, "job reaped");
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Signal cancellation to every running job
    pub fn cancel_all(&self) {
        for job in &self.running {
            job.cancel.cancel();
        }
    }

    /// Abort every running job without waiting for it
    ///
    /// Returns the ids of the abandoned jobs.
    pub fn abort_all(&mut self) -> Vec<Uuid> {
        self.running
            .drain(..)
            .map(|job| {
                job.cancel.cancel();
                job.handle.abort();
                job.job_id
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.running.len())
    }

    pub fn running_job_ids(&self) -> Vec<Uuid> {
        self.running.iter().map(|job| job.job_id).collect()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("running", &self.running_job_ids())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for job in &self.running {
            job.handle.abort();
        }
    }
}
