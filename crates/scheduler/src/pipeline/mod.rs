//! Per-job execution pipeline
//!
//! Every claimed job runs the same fixed phase sequence:
//!
//! ```text
//! Validate -> Setup -> ExtractHierarchy -> CreateReducedContent -> Distribute -> Cleanup
//! ```
//!
//! A failing phase stops the sequence and the job completes with an `Error`
//! outcome. `CreateReducedContent` only runs for
//! [`TaskAction::HierarchyAndReduction`] jobs. The job's cancellation token
//! is checked before every phase up to `Distribute` and inside every remote
//! poll wait.
//!
//! This module provides:
//! - [`JobRunner`] - executes one job of a content type
//! - [`PipelinePhases`] / [`run_pipeline`] - the phase contract and its driver
//! - [`ContentReductionRunner`] - phases backed by a
//!   [`DocumentProcessor`](crate::processing::DocumentProcessor)
//! - [`RunnerRegistry`] - runners keyed by content type

mod content;
mod registry;
mod remote;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::duration_millis;
use crate::job::{ExtractedHierarchy, Job, JobOutcome, TaskAction};
use crate::processing::output::OutputError;
use crate::processing::{ProcessorError, RemoteTaskRef};
use crate::reliability::RetryPolicy;

pub use content::ContentReductionRunner;
pub use registry::RunnerRegistry;
pub use remote::{run_remote_task, RemoteTaskTimeouts};

/// Pipeline phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validate,
    Setup,
    ExtractHierarchy,
    CreateReducedContent,
    Distribute,
    Cleanup,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::Setup => "setup",
            Self::ExtractHierarchy => "extract_hierarchy",
            Self::CreateReducedContent => "create_reduced_content",
            Self::Distribute => "distribute",
            Self::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Errors that fail a job
///
/// These never escape a runner; they become the status message of an
/// `Error` outcome.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Preconditions not met
    #[error("validation failed: {0}")]
    Validation(String),

    /// Working area could not be prepared
    #[error("setup failed: {0}")]
    Setup(String),

    /// Working copy does not match the recorded checksum
    #[error("master content checksum mismatch: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Remote task never reported a start time
    #[error("remote task {task} did not start within {limit:?}")]
    TaskStartTimeout { task: RemoteTaskRef, limit: Duration },

    /// Remote task started but never reported a finish time
    #[error("remote task {task} did not finish within {limit:?}")]
    TaskExecutionTimeout { task: RemoteTaskRef, limit: Duration },

    /// A single processor call did not return in time
    #[error("document processor call '{operation}' timed out after {limit:?}")]
    RemoteCallTimeout {
        operation: &'static str,
        limit: Duration,
    },

    /// Processor returned an error
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// Extraction output missing or unreadable
    #[error(transparent)]
    ExtractionOutput(#[from] OutputError),

    /// Reduced content could not be produced
    #[error("reduction failed: {0}")]
    Reduction(String),

    /// Artifact could not be published
    #[error("distribution failed: {0}")]
    Distribution(String),

    /// Working area could not be removed
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    /// Cancellation was requested
    #[error("job canceled during {phase}")]
    Cancelled { phase: Phase },
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Parent directory of per-job working areas
    pub working_root: PathBuf,

    /// Serving location for reduced content (required for reduction jobs)
    pub distribution_root: Option<PathBuf>,

    /// Remote task timeouts
    pub remote_timeouts: RemoteTaskTimeouts,

    /// Retry policy for local filesystem operations
    pub fs_retry: RetryPolicy,

    /// Budget for the processor reachability probe
    #[serde(with = "duration_millis")]
    pub ping_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            working_root: std::env::temp_dir().join("content-reduction"),
            distribution_root: None,
            remote_timeouts: RemoteTaskTimeouts::default(),
            fs_retry: RetryPolicy::linear(),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working area root
    pub fn with_working_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.working_root = root.into();
        self
    }

    /// Set the distribution root
    pub fn with_distribution_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.distribution_root = Some(root.into());
        self
    }

    /// Set remote task timeouts
    pub fn with_remote_timeouts(mut self, timeouts: RemoteTaskTimeouts) -> Self {
        self.remote_timeouts = timeouts;
        self
    }

    /// Set the filesystem retry policy
    pub fn with_fs_retry(mut self, policy: RetryPolicy) -> Self {
        self.fs_retry = policy;
        self
    }
}

/// Everything a runner needs to execute one job
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, cancel: CancellationToken) -> Self {
        Self { job, cancel }
    }

    /// Fail with `Cancelled` if cancellation has been requested
    pub fn check_cancelled(&self, phase: Phase) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled { phase })
        } else {
            Ok(())
        }
    }
}

/// Intermediate results carried from phase to phase
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    /// Per-job working area
    pub working_dir: Option<PathBuf>,
    /// Copy of the master content inside the working area
    pub working_copy: Option<PathBuf>,
    /// Output of the extraction phase
    pub hierarchy: Option<ExtractedHierarchy>,
    /// Output of the reduction phase
    pub reduced_artifact: Option<PathBuf>,
}

/// The fixed phase sequence for one content type
#[async_trait]
pub trait PipelinePhases: Send + Sync {
    async fn validate(&self, ctx: &JobContext) -> Result<(), PipelineError>;

    async fn setup(&self, ctx: &JobContext, state: &mut PipelineState)
        -> Result<(), PipelineError>;

    async fn extract_hierarchy(
        &self,
        ctx: &JobContext,
        state: &PipelineState,
    ) -> Result<ExtractedHierarchy, PipelineError>;

    async fn create_reduced_content(
        &self,
        ctx: &JobContext,
        state: &PipelineState,
    ) -> Result<PathBuf, PipelineError>;

    /// Publish the artifact; returns the served path, if any
    async fn distribute(
        &self,
        ctx: &JobContext,
        state: &PipelineState,
    ) -> Result<Option<PathBuf>, PipelineError>;

    async fn cleanup(&self, ctx: &JobContext, state: &PipelineState)
        -> Result<(), PipelineError>;
}

/// Executes jobs of one content type
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    /// Content type tag this runner handles
    fn content_type(&self) -> &str;

    /// Run the job to a terminal outcome
    async fn execute(&self, ctx: JobContext) -> JobOutcome;
}

/// Drive `phases` through the phase sequence for one job
pub async fn run_pipeline<P>(phases: &P, ctx: &JobContext) -> JobOutcome
where
    P: PipelinePhases + ?Sized,
{
    let job_id = ctx.job.id;
    let mut state = PipelineState::default();

    match drive(phases, ctx, &mut state).await {
        Ok(result_path) => {
            let message = match ctx.job.task_action {
                TaskAction::HierarchyOnly => format!(
                    "hierarchy extracted ({} fields)",
                    state.hierarchy.as_ref().map_or(0, |h| h.fields.len())
                ),
                TaskAction::HierarchyAndReduction => "reduced content published".to_string(),
            };
            info!(%job_id, "job succeeded: {}", message);
            JobOutcome::reduced(
                job_id,
                result_path.map(|p| p.to_string_lossy().into_owned()),
                state.hierarchy,
                message,
            )
        }
        Err(e) => {
            warn!(%job_id, error = %e, "job failed");
            JobOutcome::error(job_id, e.to_string()).with_hierarchy(state.hierarchy)
        }
    }
}

async fn drive<P>(
    phases: &P,
    ctx: &JobContext,
    state: &mut PipelineState,
) -> Result<Option<PathBuf>, PipelineError>
where
    P: PipelinePhases + ?Sized,
{
    let job_id = ctx.job.id;

    enter(ctx, Phase::Validate)?;
    phases
        .validate(ctx)
        .instrument(tracing::info_span!("phase", %job_id, phase = %Phase::Validate))
        .await?;

    enter(ctx, Phase::Setup)?;
    phases
        .setup(ctx, state)
        .instrument(tracing::info_span!("phase", %job_id, phase = %Phase::Setup))
        .await?;

    enter(ctx, Phase::ExtractHierarchy)?;
    let hierarchy = phases
        .extract_hierarchy(ctx, state)
        .instrument(tracing::info_span!("phase", %job_id, phase = %Phase::ExtractHierarchy))
        .await?;
    state.hierarchy = Some(hierarchy);

    if ctx.job.task_action.includes_reduction() {
        enter(ctx, Phase::CreateReducedContent)?;
        let artifact = phases
            .create_reduced_content(ctx, state)
            .instrument(
                tracing::info_span!("phase", %job_id, phase = %Phase::CreateReducedContent),
            )
            .await?;
        state.reduced_artifact = Some(artifact);
    }

    enter(ctx, Phase::Distribute)?;
    let result_path = phases
        .distribute(ctx, state)
        .instrument(tracing::info_span!("phase", %job_id, phase = %Phase::Distribute))
        .await?;

    // The artifact is published; a late cancellation no longer applies
    debug!(%job_id, phase = %Phase::Cleanup, "entering phase");
    phases
        .cleanup(ctx, state)
        .instrument(tracing::info_span!("phase", %job_id, phase = %Phase::Cleanup))
        .await?;

    Ok(result_path)
}

fn enter(ctx: &JobContext, phase: Phase) -> Result<(), PipelineError> {
    ctx.check_cancelled(phase)?;
    debug!(job_id = %ctx.job.id, %phase, "entering phase");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::*;
    use crate::job::{Field, JobStatus, NewJob, StructureKind};

    /// Phases that record invocations and fail on request
    #[derive(Default)]
    struct RecordingPhases {
        calls: Mutex<Vec<Phase>>,
        fail_at: Option<Phase>,
        cancel_after: Option<(Phase, CancellationToken)>,
    }

    impl RecordingPhases {
        fn failing_at(phase: Phase) -> Self {
            Self {
                fail_at: Some(phase),
                ..Default::default()
            }
        }

        fn record(&self, phase: Phase) -> Result<(), PipelineError> {
            self.calls.lock().push(phase);
            if let Some((after, token)) = &self.cancel_after {
                if *after == phase {
                    token.cancel();
                }
            }
            if self.fail_at == Some(phase) {
                return Err(PipelineError::Validation(format!("{phase} exploded")));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<Phase> {
            self.calls.lock().clone()
        }
    }

    fn hierarchy() -> ExtractedHierarchy {
        ExtractedHierarchy::new(vec![Field {
            name: "region".into(),
            display_name: "Region".into(),
            value_delimiter: "|".into(),
            structure_kind: StructureKind::Flat,
            values: vec!["East".into()],
        }])
    }

    #[async_trait]
    impl PipelinePhases for RecordingPhases {
        async fn validate(&self, _ctx: &JobContext) -> Result<(), PipelineError> {
            self.record(Phase::Validate)
        }

        async fn setup(
            &self,
            _ctx: &JobContext,
            _state: &mut PipelineState,
        ) -> Result<(), PipelineError> {
            self.record(Phase::Setup)
        }

        async fn extract_hierarchy(
            &self,
            _ctx: &JobContext,
            _state: &PipelineState,
        ) -> Result<ExtractedHierarchy, PipelineError> {
            self.record(Phase::ExtractHierarchy)?;
            Ok(hierarchy())
        }

        async fn create_reduced_content(
            &self,
            _ctx: &JobContext,
            _state: &PipelineState,
        ) -> Result<PathBuf, PipelineError> {
            self.record(Phase::CreateReducedContent)?;
            Ok(PathBuf::from("/work/reduced.qvw"))
        }

        async fn distribute(
            &self,
            _ctx: &JobContext,
            state: &PipelineState,
        ) -> Result<Option<PathBuf>, PipelineError> {
            self.record(Phase::Distribute)?;
            Ok(state
                .reduced_artifact
                .as_ref()
                .map(|_| PathBuf::from("/published/reduced.qvw")))
        }

        async fn cleanup(
            &self,
            _ctx: &JobContext,
            _state: &PipelineState,
        ) -> Result<(), PipelineError> {
            self.record(Phase::Cleanup)
        }
    }

    fn context(action: TaskAction) -> JobContext {
        let job = NewJob::new("qvw", "/content/master.qvw", "abc", action)
            .into_job(Uuid::now_v7(), Utc::now());
        JobContext::new(job, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_full_reduction_runs_every_phase() {
        let phases = RecordingPhases::default();
        let outcome = run_pipeline(&phases, &context(TaskAction::HierarchyAndReduction)).await;

        assert_eq!(
            phases.calls(),
            vec![
                Phase::Validate,
                Phase::Setup,
                Phase::ExtractHierarchy,
                Phase::CreateReducedContent,
                Phase::Distribute,
                Phase::Cleanup,
            ]
        );
        assert_eq!(outcome.status, JobStatus::Reduced);
        assert_eq!(
            outcome.result_file_path.as_deref(),
            Some("/published/reduced.qvw")
        );
        assert_eq!(outcome.extracted_hierarchy, Some(hierarchy()));
    }

    #[tokio::test]
    async fn test_hierarchy_only_skips_reduction() {
        let phases = RecordingPhases::default();
        let outcome = run_pipeline(&phases, &context(TaskAction::HierarchyOnly)).await;

        assert!(!phases.calls().contains(&Phase::CreateReducedContent));
        assert_eq!(outcome.status, JobStatus::Reduced);
        assert!(outcome.result_file_path.is_none());
        assert_eq!(outcome.extracted_hierarchy, Some(hierarchy()));
    }

    #[tokio::test]
    async fn test_extraction_failure_short_circuits() {
        let phases = RecordingPhases::failing_at(Phase::ExtractHierarchy);
        let outcome = run_pipeline(&phases, &context(TaskAction::HierarchyAndReduction)).await;

        assert_eq!(
            phases.calls(),
            vec![Phase::Validate, Phase::Setup, Phase::ExtractHierarchy]
        );
        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.status_message.contains("extract_hierarchy exploded"));
        assert!(outcome.extracted_hierarchy.is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_runs_nothing_else() {
        let phases = RecordingPhases::failing_at(Phase::Validate);
        let outcome = run_pipeline(&phases, &context(TaskAction::HierarchyOnly)).await;

        assert_eq!(phases.calls(), vec![Phase::Validate]);
        assert_eq!(outcome.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_late_failure_keeps_extracted_hierarchy() {
        let phases = RecordingPhases::failing_at(Phase::Distribute);
        let outcome = run_pipeline(&phases, &context(TaskAction::HierarchyAndReduction)).await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert_eq!(outcome.extracted_hierarchy, Some(hierarchy()));
        assert!(!phases.calls().contains(&Phase::Cleanup));
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_phase() {
        let ctx = context(TaskAction::HierarchyAndReduction);
        let phases = RecordingPhases {
            cancel_after: Some((Phase::Setup, ctx.cancel.clone())),
            ..Default::default()
        };

        let outcome = run_pipeline(&phases, &ctx).await;

        assert_eq!(phases.calls(), vec![Phase::Validate, Phase::Setup]);
        assert_eq!(outcome.status, JobStatus::Error);
        assert_eq!(
            outcome.status_message,
            "job canceled during extract_hierarchy"
        );
    }

    #[tokio::test]
    async fn test_cancellation_after_distribute_still_succeeds() {
        let ctx = context(TaskAction::HierarchyAndReduction);
        let phases = RecordingPhases {
            cancel_after: Some((Phase::Distribute, ctx.cancel.clone())),
            ..Default::default()
        };

        let outcome = run_pipeline(&phases, &ctx).await;

        assert_eq!(phases.calls().last(), Some(&Phase::Cleanup));
        assert_eq!(outcome.status, JobStatus::Reduced);
        assert_eq!(outcome.status_message, "reduced content published");
    }

    #[tokio::test]
    async fn test_runner_trait_objects_are_shareable() {
        fn assert_send_sync<T: Send + Sync + ?Sized>(_: &T) {}
        let phases: Arc<dyn PipelinePhases> = Arc::new(RecordingPhases::default());
        assert_send_sync(phases.as_ref());
    }
}
