//! Driving a single remote task to completion

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{JobContext, Phase, PipelineError};
use crate::config::duration_millis;
use crate::processing::{DocumentProcessor, ProcessorError, RemoteTaskRef};

/// Time budgets for remote tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteTaskTimeouts {
    /// Sleep between status polls
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// How long a task may take to report a start time
    #[serde(with = "duration_millis")]
    pub max_start_delay: Duration,

    /// How long a started task may take to report a finish time
    #[serde(with = "duration_millis")]
    pub max_elapsed_run: Duration,

    /// Budget for any single processor call
    #[serde(with = "duration_millis")]
    pub call_timeout: Duration,
}

impl Default for RemoteTaskTimeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_start_delay: Duration::from_secs(300),
            max_elapsed_run: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RemoteTaskTimeouts {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_start_delay(mut self, delay: Duration) -> Self {
        self.max_start_delay = delay;
        self
    }

    pub fn with_max_elapsed_run(mut self, limit: Duration) -> Self {
        self.max_elapsed_run = limit;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Create a remote task, run it to completion and delete it
///
/// `create` issues the creation request. The task is deleted whether or not
/// it completed; a failed delete is logged and does not change the result.
pub async fn run_remote_task<F>(
    processor: &dyn DocumentProcessor,
    create: F,
    timeouts: &RemoteTaskTimeouts,
    ctx: &JobContext,
    phase: Phase,
) -> Result<(), PipelineError>
where
    F: Future<Output = Result<RemoteTaskRef, ProcessorError>> + Send,
{
    let task = bounded(timeouts.call_timeout, "create task", create).await?;
    debug!(job_id = %ctx.job.id, %task, %phase, "remote task created");

    let result = wait_for_completion(processor, &task, timeouts, ctx, phase).await;

    match bounded(timeouts.call_timeout, "delete task", processor.delete(&task)).await {
        Ok(true) => debug!(%task, "remote task deleted"),
        Ok(false) => warn!(%task, "remote task already gone at delete"),
        Err(e) => warn!(%task, error = %e, "failed to delete remote task"),
    }

    result
}

async fn wait_for_completion(
    processor: &dyn DocumentProcessor,
    task: &RemoteTaskRef,
    timeouts: &RemoteTaskTimeouts,
    ctx: &JobContext,
    phase: Phase,
) -> Result<(), PipelineError> {
    let start_wait = Instant::now();
    let status = loop {
        ctx.check_cancelled(phase)?;

        // The processor may ignore a run request while busy, so keep asking
        bounded(timeouts.call_timeout, "run task", processor.run(task)).await?;
        let status =
            bounded(timeouts.call_timeout, "get status", processor.get_status(task)).await?;
        if status.is_started() {
            break status;
        }

        if start_wait.elapsed() >= timeouts.max_start_delay {
            return Err(PipelineError::TaskStartTimeout {
                task: task.clone(),
                limit: timeouts.max_start_delay,
            });
        }
        pause(timeouts.poll_interval, ctx, phase).await?;
    };
    debug!(%task, "remote task started");

    if status.is_finished() {
        return Ok(());
    }

    let run_wait = Instant::now();
    loop {
        pause(timeouts.poll_interval, ctx, phase).await?;

        let status =
            bounded(timeouts.call_timeout, "get status", processor.get_status(task)).await?;
        if status.is_finished() {
            debug!(
                %task,
                elapsed_ms = run_wait.elapsed().as_millis() as u64,
                "remote task finished"
            );
            return Ok(());
        }

        if run_wait.elapsed() >= timeouts.max_elapsed_run {
            return Err(PipelineError::TaskExecutionTimeout {
                task: task.clone(),
                limit: timeouts.max_elapsed_run,
            });
        }
    }
}

async fn bounded<T, F>(
    limit: Duration,
    operation: &'static str,
    call: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, ProcessorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(PipelineError::from),
        Err(_) => Err(PipelineError::RemoteCallTimeout { operation, limit }),
    }
}

async fn pause(interval: Duration, ctx: &JobContext, phase: Phase) -> Result<(), PipelineError> {
    tokio::select! {
        _ = tokio::time::sleep(interval) => Ok(()),
        _ = ctx.cancel.cancelled() => Err(PipelineError::Cancelled { phase }),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::job::{NewJob, TaskAction};
    use crate::processing::{ExtractionRequest, SimulatedDocumentProcessor, SimulationConfig};

    fn fast_timeouts() -> RemoteTaskTimeouts {
        RemoteTaskTimeouts::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_max_start_delay(Duration::from_millis(60))
            .with_max_elapsed_run(Duration::from_millis(60))
            .with_call_timeout(Duration::from_secs(1))
    }

    fn context() -> JobContext {
        let job = NewJob::new("qvw", "/content/master.qvw", "abc", TaskAction::HierarchyOnly)
            .into_job(Uuid::now_v7(), Utc::now());
        JobContext::new(job, CancellationToken::new())
    }

    fn request(dir: &std::path::Path) -> ExtractionRequest {
        ExtractionRequest {
            source_path: dir.join("master.qvw"),
            output_dir: dir.join("hierarchy"),
        }
    }

    #[tokio::test]
    async fn test_completed_task_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let processor = SimulatedDocumentProcessor::new(
            SimulationConfig::default().with_run_duration(Duration::from_millis(10)),
        );
        let req = request(dir.path());

        run_remote_task(
            &processor,
            processor.create_extraction_task(&req),
            &fast_timeouts(),
            &context(),
            Phase::ExtractHierarchy,
        )
        .await
        .unwrap();

        assert_eq!(processor.created_count(), 1);
        assert_eq!(processor.deleted_tasks().len(), 1);
        assert_eq!(processor.live_task_count(), 0);
        assert!(req.output_dir.join("fields.tsv").exists());
    }

    #[tokio::test]
    async fn test_start_timeout_still_deletes_task() {
        let dir = tempfile::tempdir().unwrap();
        let processor =
            SimulatedDocumentProcessor::new(SimulationConfig::default().never_starting());
        let req = request(dir.path());

        let err = run_remote_task(
            &processor,
            processor.create_extraction_task(&req),
            &fast_timeouts(),
            &context(),
            Phase::ExtractHierarchy,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::TaskStartTimeout { .. }));
        assert_eq!(processor.deleted_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_execution_timeout_still_deletes_task() {
        let dir = tempfile::tempdir().unwrap();
        let processor =
            SimulatedDocumentProcessor::new(SimulationConfig::default().never_finishing());
        let req = request(dir.path());

        let err = run_remote_task(
            &processor,
            processor.create_extraction_task(&req),
            &fast_timeouts(),
            &context(),
            Phase::ExtractHierarchy,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::TaskExecutionTimeout { .. }));
        assert_eq!(processor.live_task_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let dir = tempfile::tempdir().unwrap();
        let processor =
            SimulatedDocumentProcessor::new(SimulationConfig::default().never_finishing());
        let req = request(dir.path());
        let ctx = context();
        let timeouts = fast_timeouts().with_max_elapsed_run(Duration::from_secs(60));

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let err = run_remote_task(
            &processor,
            processor.create_extraction_task(&req),
            &timeouts,
            &ctx,
            Phase::ExtractHierarchy,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Cancelled {
                phase: Phase::ExtractHierarchy
            }
        ));
        assert_eq!(processor.live_task_count(), 0);
    }
}
