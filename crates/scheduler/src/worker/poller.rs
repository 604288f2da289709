//! Job monitor loop
//!
//! Each cycle writes back finished jobs, tops the pool up with claimed jobs
//! and sleeps. On cancellation it stops claiming and drains the pool within
//! a bounded wait.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::pool::{WorkerPool, WorkerPoolError};
use crate::config::duration_millis;
use crate::job::JobOutcome;
use crate::persistence::{StoreError, TaskQueueStore, WriteOutcome};
use crate::pipeline::RunnerRegistry;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Maximum jobs running at once in this poller
    pub max_parallel_tasks: usize,

    /// Jobs younger than this are left in the queue
    #[serde(with = "duration_millis")]
    pub task_age_before_execution: Duration,

    /// Sleep between cycles
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// How long to wait for running jobs after cancellation
    #[serde(with = "duration_millis")]
    pub wait_time_on_stop: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 1,
            task_age_before_execution: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            wait_time_on_stop: Duration::from_secs(180),
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrency
    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max;
        self
    }

    /// Set minimum job age before claiming
    pub fn with_task_age_before_execution(mut self, age: Duration) -> Self {
        self.task_age_before_execution = age;
        self
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the drain budget used on cancellation
    pub fn with_wait_time_on_stop(mut self, wait: Duration) -> Self {
        self.wait_time_on_stop = wait;
        self
    }
}

/// Faults of the poll loop itself
///
/// Job failures never surface here; they are written back as outcomes.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Pool invariant violated
    #[error("worker pool error: {0}")]
    Pool(#[from] WorkerPoolError),
}

/// Claims jobs from the queue and runs them in a [`WorkerPool`]
pub struct JobPoller {
    id: String,
    store: Arc<dyn TaskQueueStore>,
    pool: WorkerPool,
    config: PollerConfig,
}

impl JobPoller {
    /// Create a new poller
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn TaskQueueStore>,
        registry: RunnerRegistry,
        config: PollerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            pool: WorkerPool::new(config.max_parallel_tasks, registry),
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `cancel` fires, then drain
    ///
    /// Returns the number of jobs abandoned at the drain deadline after a
    /// normal stop. Any store or pool fault ends the loop with an error and
    /// aborts whatever is still running.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<usize, PollerError> {
        info!(
            poller_id = %self.id,
            max_parallel_tasks = self.config.max_parallel_tasks,
            "poller started"
        );

        if let Err(e) = self.poll_until_cancelled(&cancel).await {
            error!(poller_id = %self.id, error = %e, "poller faulted");
            let abandoned = self.pool.abort_all();
            if !abandoned.is_empty() {
                warn!(poller_id = %self.id, abandoned = abandoned.len(), "aborted running jobs");
            }
            return Err(e);
        }

        let abandoned = self.drain().await?;
        info!(poller_id = %self.id, abandoned, "poller stopped");
        Ok(abandoned)
    }

    async fn poll_until_cancelled(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), PollerError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.poll_cycle().await?;

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => {
                    debug!(poller_id = %self.id, "cancellation received during wait");
                    return Ok(());
                }
            }
        }
    }

    /// One write-back and claim cycle
    ///
    /// Returns the number of jobs admitted.
    #[instrument(skip(self), fields(poller_id = %self.id))]
    pub async fn poll_cycle(&mut self) -> Result<usize, PollerError> {
        self.write_back_completed().await?;

        let free_slots = self.pool.free_slots();
        if free_slots == 0 {
            return Ok(0);
        }

        let jobs = self
            .store
            .claim_ready_jobs(free_slots, self.config.task_age_before_execution)
            .await?;
        if !jobs.is_empty() {
            info!(poller_id = %self.id, count = jobs.len(), "claimed jobs");
        }

        let claimed = jobs.len();
        for job in jobs {
            self.pool.admit(job)?;
        }
        Ok(claimed)
    }

    async fn write_back_completed(&mut self) -> Result<(), PollerError> {
        for outcome in self.pool.reap_completed().await {
            self.write_back(&outcome).await?;
        }
        Ok(())
    }

    async fn write_back(&self, outcome: &JobOutcome) -> Result<(), PollerError> {
        match self.store.write_result(outcome).await? {
            WriteOutcome::Applied => info!(
                poller_id = %self.id,
                job_id = %outcome.job_id,
                status = %outcome.status,
                message = %outcome.status_message,
                "job result written"
            ),
            WriteOutcome::SkippedCanceled => info!(
                poller_id = %self.id,
                job_id = %outcome.job_id,
                "job was canceled, result dropped"
            ),
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<usize, PollerError> {
        self.pool.cancel_all();
        let deadline = Instant::now() + self.config.wait_time_on_stop;
        info!(poller_id = %self.id, running = self.pool.len(), "draining running jobs");

        loop {
            self.write_back_completed().await?;
            if self.pool.is_empty() {
                return Ok(0);
            }

            if Instant::now() >= deadline {
                let abandoned = self.pool.abort_all();
                warn!(
                    poller_id = %self.id,
                    abandoned = abandoned.len(),
                    job_ids = ?abandoned,
                    "stop wait expired, abandoning running jobs"
                );
                return Ok(abandoned.len());
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Jobs currently running in this poller's pool
    pub fn running(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::job::{JobStatus, NewJob, TaskAction};
    use crate::persistence::InMemoryTaskQueueStore;
    use crate::pipeline::{JobContext, JobRunner};

    struct DelayRunner(Duration);

    #[async_trait]
    impl JobRunner for DelayRunner {
        fn content_type(&self) -> &str {
            "qvw"
        }

        async fn execute(&self, ctx: JobContext) -> JobOutcome {
            tokio::select! {
                _ = tokio::time::sleep(self.0) => JobOutcome::reduced(ctx.job.id, None, None, "ok"),
                _ = ctx.cancel.cancelled() => JobOutcome::error(ctx.job.id, "canceled"),
            }
        }
    }

    fn config() -> PollerConfig {
        PollerConfig::new()
            .with_max_parallel_tasks(2)
            .with_task_age_before_execution(Duration::ZERO)
            .with_poll_interval(Duration::from_millis(10))
            .with_wait_time_on_stop(Duration::from_secs(2))
    }

    fn new_job() -> NewJob {
        NewJob::new("qvw", "/content/a.qvw", "abc", TaskAction::HierarchyOnly)
    }

    fn poller(store: Arc<InMemoryTaskQueueStore>, delay: Duration) -> JobPoller {
        let registry = RunnerRegistry::new().with_runner(DelayRunner(delay));
        JobPoller::new("poller-test", store, registry, config())
    }

    #[tokio::test]
    async fn test_cycle_claims_two_oldest_of_three() {
        let store = Arc::new(InMemoryTaskQueueStore::new());
        let base = Utc::now() - chrono::Duration::minutes(5);
        let oldest = store.enqueue_at(new_job(), base);
        let middle = store.enqueue_at(new_job(), base + chrono::Duration::seconds(1));
        let newest = store.enqueue_at(new_job(), base + chrono::Duration::seconds(2));

        let mut poller = poller(store.clone(), Duration::from_secs(10));
        assert_eq!(poller.poll_cycle().await.unwrap(), 2);

        assert_eq!(store.get_job(oldest.id).await.unwrap().status, JobStatus::Reducing);
        assert_eq!(store.get_job(middle.id).await.unwrap().status, JobStatus::Reducing);
        assert_eq!(store.get_job(newest.id).await.unwrap().status, JobStatus::Queued);

        // Pool is full, so the next cycle claims nothing
        assert_eq!(poller.poll_cycle().await.unwrap(), 0);
        assert_eq!(poller.running(), 2);
    }

    #[tokio::test]
    async fn test_run_processes_queue_and_stops() {
        let store = Arc::new(InMemoryTaskQueueStore::new());
        let ids: Vec<Uuid> = (0..5)
            .map(|i| {
                store
                    .enqueue_at(new_job(), Utc::now() - chrono::Duration::seconds(60 - i))
                    .id
            })
            .collect();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            poller(store.clone(), Duration::from_millis(10)).run(cancel.clone()),
        );

        for _ in 0..300 {
            if store.count_with_status(JobStatus::Reduced) == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        for id in ids {
            assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Reduced);
        }
    }

    #[tokio::test]
    async fn test_stop_drains_running_jobs() {
        let store = Arc::new(InMemoryTaskQueueStore::new());
        let job = store.enqueue_at(new_job(), Utc::now() - chrono::Duration::minutes(1));

        let mut poller = poller(store.clone(), Duration::from_secs(30));
        poller.poll_cycle().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(poller.run(cancel).await.unwrap(), 0);

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.status_message.as_deref(), Some("canceled"));
    }

    /// Ignores its cancellation token
    struct StubbornRunner;

    #[async_trait]
    impl JobRunner for StubbornRunner {
        fn content_type(&self) -> &str {
            "qvw"
        }

        async fn execute(&self, ctx: JobContext) -> JobOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            JobOutcome::reduced(ctx.job.id, None, None, "ok")
        }
    }

    #[tokio::test]
    async fn test_drain_deadline_abandons_stubborn_jobs() {
        let store = Arc::new(InMemoryTaskQueueStore::new());
        let job = store.enqueue_at(new_job(), Utc::now() - chrono::Duration::minutes(1));

        let registry = RunnerRegistry::new().with_runner(StubbornRunner);
        let config = config().with_wait_time_on_stop(Duration::from_millis(200));
        let mut poller = JobPoller::new("poller-test", store.clone(), registry, config);
        poller.poll_cycle().await.unwrap();
        assert_eq!(poller.running(), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let abandoned = tokio::time::timeout(Duration::from_secs(5), poller.run(cancel))
            .await
            .expect("drain ignored its deadline")
            .unwrap();

        assert_eq!(abandoned, 1);
        // Nothing is written back for an abandoned job
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Reducing);
    }

    #[tokio::test]
    async fn test_canceled_job_result_is_dropped() {
        let store = Arc::new(InMemoryTaskQueueStore::new());
        let job = store.enqueue_at(new_job(), Utc::now() - chrono::Duration::minutes(1));

        let mut poller = poller(store.clone(), Duration::from_millis(5));
        poller.poll_cycle().await.unwrap();
        assert!(store.cancel_job(job.id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.poll_cycle().await.unwrap();

        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Canceled);
        assert_eq!(poller.running(), 0);
    }
}
