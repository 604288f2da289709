//! Pipeline phases backed by a document processor

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::{
    run_pipeline, run_remote_task, JobContext, JobRunner, Phase, PipelineConfig, PipelineError,
    PipelinePhases, PipelineState,
};
use crate::job::{ExtractedHierarchy, FieldSelection, JobOutcome};
use crate::processing::output::read_hierarchy;
use crate::processing::{DocumentProcessor, ExtractionRequest, ReductionRequest};

const MASTER_DIR: &str = "master";
const HIERARCHY_DIR: &str = "hierarchy";
const REDUCED_DIR: &str = "reduced";

/// Runs reduction jobs for one content type through a [`DocumentProcessor`]
///
/// Working area layout, under `working_root/<job id>/`:
///
/// ```text
/// master/<file>     verified copy of the master content
/// hierarchy/        extraction output
/// reduced/<file>    reduction output
/// ```
///
/// Reduced content is published to `distribution_root/<job id>/<file>`.
pub struct ContentReductionRunner {
    content_type: String,
    processor: Arc<dyn DocumentProcessor>,
    config: PipelineConfig,
}

impl ContentReductionRunner {
    pub fn new(
        content_type: impl Into<String>,
        processor: Arc<dyn DocumentProcessor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            processor,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn working_dir(&self, ctx: &JobContext) -> PathBuf {
        self.config.working_root.join(ctx.job.id.to_string())
    }
}

#[async_trait]
impl JobRunner for ContentReductionRunner {
    fn content_type(&self) -> &str {
        &self.content_type
    }

    async fn execute(&self, ctx: JobContext) -> JobOutcome {
        run_pipeline(self, &ctx).await
    }
}

#[async_trait]
impl PipelinePhases for ContentReductionRunner {
    async fn validate(&self, ctx: &JobContext) -> Result<(), PipelineError> {
        let job = &ctx.job;

        if job.master_content_checksum.trim().is_empty() {
            return Err(PipelineError::Validation(
                "job has no master content checksum".into(),
            ));
        }
        master_file_name(&job.master_file_path)?;

        match tokio::fs::metadata(&job.master_file_path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(PipelineError::Validation(format!(
                    "master content is not a file: {}",
                    job.master_file_path
                )))
            }
            Err(_) => {
                return Err(PipelineError::Validation(format!(
                    "master content not found: {}",
                    job.master_file_path
                )))
            }
        }

        if !is_dir(&self.config.working_root).await {
            return Err(PipelineError::Validation(format!(
                "working root does not exist: {}",
                self.config.working_root.display()
            )));
        }

        if job.task_action.includes_reduction() {
            if job.selection_criteria.is_empty() {
                return Err(PipelineError::Validation(
                    "reduction requested without selection criteria".into(),
                ));
            }
            match &self.config.distribution_root {
                Some(root) if is_dir(root).await => {}
                Some(root) => {
                    return Err(PipelineError::Validation(format!(
                        "distribution root does not exist: {}",
                        root.display()
                    )))
                }
                None => {
                    return Err(PipelineError::Validation(
                        "no distribution root configured".into(),
                    ))
                }
            }
        }

        match tokio::time::timeout(self.config.ping_timeout, self.processor.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PipelineError::Validation(format!(
                "document processor unreachable: {e}"
            ))),
            Err(_) => Err(PipelineError::Validation(format!(
                "document processor did not answer within {:?}",
                self.config.ping_timeout
            ))),
        }
    }

    async fn setup(
        &self,
        ctx: &JobContext,
        state: &mut PipelineState,
    ) -> Result<(), PipelineError> {
        let retry = &self.config.fs_retry;
        let working_dir = self.working_dir(ctx);
        let master = PathBuf::from(&ctx.job.master_file_path);
        let file_name = master_file_name(&ctx.job.master_file_path)?;
        let copy_dir = working_dir.join(MASTER_DIR);
        let copy = copy_dir.join(file_name);

        // A crashed earlier attempt may have left a working area behind
        if is_dir(&working_dir).await {
            retry
                .retry("remove stale working area", || {
                    tokio::fs::remove_dir_all(working_dir.clone())
                })
                .await
                .map_err(|e| PipelineError::Setup(format!("{}: {e}", working_dir.display())))?;
        }

        retry
            .retry("create working area", || {
                tokio::fs::create_dir_all(copy_dir.clone())
            })
            .await
            .map_err(|e| PipelineError::Setup(format!("{}: {e}", copy_dir.display())))?;
        state.working_dir = Some(working_dir.clone());

        retry
            .retry("copy master content", || {
                tokio::fs::copy(master.clone(), copy.clone())
            })
            .await
            .map_err(|e| {
                PipelineError::Setup(format!("copy {} failed: {e}", master.display()))
            })?;

        let actual = sha256_file(&copy)
            .await
            .map_err(|e| PipelineError::Setup(format!("checksum {} failed: {e}", copy.display())))?;
        let expected = ctx.job.master_content_checksum.trim();
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(PipelineError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        debug!(job_id = %ctx.job.id, copy = %copy.display(), "working copy verified");
        state.working_copy = Some(copy);
        Ok(())
    }

    async fn extract_hierarchy(
        &self,
        ctx: &JobContext,
        state: &PipelineState,
    ) -> Result<ExtractedHierarchy, PipelineError> {
        let (working_dir, copy) = prepared(state)?;
        let output_dir = working_dir.join(HIERARCHY_DIR);

        let request = ExtractionRequest {
            source_path: copy.to_path_buf(),
            output_dir: output_dir.clone(),
        };
        run_remote_task(
            self.processor.as_ref(),
            self.processor.create_extraction_task(&request),
            &self.config.remote_timeouts,
            ctx,
            Phase::ExtractHierarchy,
        )
        .await?;

        let hierarchy = read_hierarchy(&output_dir).await?;
        info!(job_id = %ctx.job.id, fields = hierarchy.fields.len(), "hierarchy extracted");
        Ok(hierarchy)
    }

    async fn create_reduced_content(
        &self,
        ctx: &JobContext,
        state: &PipelineState,
    ) -> Result<PathBuf, PipelineError> {
        let (working_dir, copy) = prepared(state)?;
        let hierarchy = state
            .hierarchy
            .as_ref()
            .ok_or_else(|| PipelineError::Reduction("no extracted hierarchy".into()))?;

        let selections: Vec<FieldSelection> = ctx
            .job
            .selection_criteria
            .iter()
            .filter(|s| hierarchy.contains(s))
            .cloned()
            .collect();
        if selections.is_empty() {
            return Err(PipelineError::Reduction(format!(
                "none of the {} selected values exist in the content",
                ctx.job.selection_criteria.len()
            )));
        }
        let skipped = ctx.job.selection_criteria.len() - selections.len();
        if skipped > 0 {
            debug!(job_id = %ctx.job.id, skipped, "ignoring selections absent from the content");
        }

        let file_name = master_file_name(&ctx.job.master_file_path)?;
        let output_path = working_dir.join(REDUCED_DIR).join(file_name);
        let request = ReductionRequest {
            source_path: copy.to_path_buf(),
            selections,
            output_path: output_path.clone(),
        };
        run_remote_task(
            self.processor.as_ref(),
            self.processor.create_reduction_task(&request),
            &self.config.remote_timeouts,
            ctx,
            Phase::CreateReducedContent,
        )
        .await?;

        match tokio::fs::metadata(&output_path).await {
            Ok(meta) if meta.is_file() => Ok(output_path),
            _ => Err(PipelineError::Reduction(format!(
                "reduced content was not produced at {}",
                output_path.display()
            ))),
        }
    }

    async fn distribute(
        &self,
        ctx: &JobContext,
        state: &PipelineState,
    ) -> Result<Option<PathBuf>, PipelineError> {
        let Some(artifact) = &state.reduced_artifact else {
            return Ok(None);
        };
        let root = self
            .config
            .distribution_root
            .as_ref()
            .ok_or_else(|| PipelineError::Distribution("no distribution root configured".into()))?;

        let target_dir = root.join(ctx.job.id.to_string());
        let file_name = master_file_name(&ctx.job.master_file_path)?;
        let target = target_dir.join(file_name);

        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| PipelineError::Distribution(format!("{}: {e}", target_dir.display())))?;
        self.config
            .fs_retry
            .retry("publish reduced content", || {
                tokio::fs::copy(artifact.clone(), target.clone())
            })
            .await
            .map_err(|e| PipelineError::Distribution(format!("{}: {e}", target.display())))?;

        info!(job_id = %ctx.job.id, target = %target.display(), "reduced content published");
        Ok(Some(target))
    }

    async fn cleanup(
        &self,
        ctx: &JobContext,
        state: &PipelineState,
    ) -> Result<(), PipelineError> {
        let Some(working_dir) = &state.working_dir else {
            return Ok(());
        };

        self.config
            .fs_retry
            .retry("remove working area", || async move {
                match tokio::fs::remove_dir_all(working_dir).await {
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            })
            .await
            .map_err(|e| PipelineError::Cleanup(format!("{}: {e}", working_dir.display())))?;

        debug!(job_id = %ctx.job.id, "working area removed");
        Ok(())
    }
}

fn prepared(state: &PipelineState) -> Result<(&Path, &Path), PipelineError> {
    match (&state.working_dir, &state.working_copy) {
        (Some(dir), Some(copy)) => Ok((dir, copy)),
        _ => Err(PipelineError::Setup("working area not prepared".into())),
    }
}

fn master_file_name(master_file_path: &str) -> Result<&std::ffi::OsStr, PipelineError> {
    Path::new(master_file_path).file_name().ok_or_else(|| {
        PipelineError::Validation(format!(
            "master content path has no file name: {master_file_path}"
        ))
    })
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Hex-encoded SHA-256 of a file's contents
pub(crate) async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::job::{JobStatus, NewJob, TaskAction};
    use crate::pipeline::RemoteTaskTimeouts;
    use crate::processing::{SimulatedDocumentProcessor, SimulationConfig};
    use crate::reliability::RetryPolicy;

    const CONTENT: &[u8] = b"master document body";

    struct Fixture {
        _dir: tempfile::TempDir,
        master: PathBuf,
        checksum: String,
        working_root: PathBuf,
        distribution_root: PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let master = dir.path().join("content").join("care-coordinator.qvw");
        let working_root = dir.path().join("work");
        let distribution_root = dir.path().join("published");
        tokio::fs::create_dir_all(master.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::create_dir_all(&working_root).await.unwrap();
        tokio::fs::create_dir_all(&distribution_root).await.unwrap();
        tokio::fs::write(&master, CONTENT).await.unwrap();

        Fixture {
            checksum: hex::encode(Sha256::digest(CONTENT)),
            _dir: dir,
            master,
            working_root,
            distribution_root,
        }
    }

    fn runner(
        fx: &Fixture,
        sim: SimulationConfig,
    ) -> (ContentReductionRunner, Arc<SimulatedDocumentProcessor>) {
        let processor = Arc::new(SimulatedDocumentProcessor::new(
            sim.with_run_duration(Duration::from_millis(5)),
        ));
        let config = PipelineConfig::new()
            .with_working_root(&fx.working_root)
            .with_distribution_root(&fx.distribution_root)
            .with_fs_retry(RetryPolicy::no_retry())
            .with_remote_timeouts(
                RemoteTaskTimeouts::default()
                    .with_poll_interval(Duration::from_millis(5))
                    .with_max_start_delay(Duration::from_millis(200))
                    .with_max_elapsed_run(Duration::from_millis(200)),
            );
        (
            ContentReductionRunner::new("qvw", processor.clone(), config),
            processor,
        )
    }

    fn context(fx: &Fixture, action: TaskAction, selections: &[(&str, &str)]) -> JobContext {
        let job = NewJob::new("qvw", fx.master.to_string_lossy(), &fx.checksum, action)
            .with_selections(
                selections
                    .iter()
                    .map(|(f, v)| FieldSelection::new(*f, *v))
                    .collect(),
            )
            .into_job(Uuid::now_v7(), Utc::now());
        JobContext::new(job, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_reduction_publishes_and_cleans_up() {
        let fx = fixture().await;
        let (runner, processor) = runner(&fx, SimulationConfig::default());
        let ctx = context(
            &fx,
            TaskAction::HierarchyAndReduction,
            &[("region", "East"), ("region", "Atlantis")],
        );

        let outcome = runner.execute(ctx.clone()).await;

        assert_eq!(outcome.status, JobStatus::Reduced, "{}", outcome.status_message);
        let published = PathBuf::from(outcome.result_file_path.unwrap());
        assert_eq!(
            published,
            fx.distribution_root
                .join(ctx.job.id.to_string())
                .join("care-coordinator.qvw")
        );
        assert_eq!(tokio::fs::read(&published).await.unwrap(), CONTENT);
        assert_eq!(outcome.extracted_hierarchy.unwrap().fields.len(), 1);
        assert!(!fx.working_root.join(ctx.job.id.to_string()).exists());
        assert_eq!(processor.created_count(), 2);
        assert_eq!(processor.live_task_count(), 0);
    }

    #[tokio::test]
    async fn test_hierarchy_only_publishes_nothing() {
        let fx = fixture().await;
        let (runner, processor) = runner(&fx, SimulationConfig::default());
        let ctx = context(&fx, TaskAction::HierarchyOnly, &[]);

        let outcome = runner.execute(ctx).await;

        assert_eq!(outcome.status, JobStatus::Reduced, "{}", outcome.status_message);
        assert!(outcome.result_file_path.is_none());
        assert!(outcome.extracted_hierarchy.is_some());
        assert_eq!(processor.created_count(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_setup() {
        let fx = fixture().await;
        let (runner, processor) = runner(&fx, SimulationConfig::default());
        let mut ctx = context(&fx, TaskAction::HierarchyOnly, &[]);
        ctx.job.master_content_checksum = "00".repeat(32);

        let outcome = runner.execute(ctx).await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.status_message.contains("checksum mismatch"));
        assert_eq!(processor.created_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_master_fails_validation() {
        let fx = fixture().await;
        let (runner, _) = runner(&fx, SimulationConfig::default());
        let mut ctx = context(&fx, TaskAction::HierarchyOnly, &[]);
        ctx.job.master_file_path = fx.working_root.join("gone.qvw").to_string_lossy().into();

        let outcome = runner.execute(ctx).await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.status_message.contains("master content not found"));
    }

    #[tokio::test]
    async fn test_unreachable_processor_fails_validation() {
        let fx = fixture().await;
        let (runner, _) = runner(&fx, SimulationConfig::default().unreachable());

        let outcome = runner
            .execute(context(&fx, TaskAction::HierarchyOnly, &[]))
            .await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.status_message.contains("unreachable"));
    }

    #[tokio::test]
    async fn test_reduction_without_selections_fails_validation() {
        let fx = fixture().await;
        let (runner, processor) = runner(&fx, SimulationConfig::default());

        let outcome = runner
            .execute(context(&fx, TaskAction::HierarchyAndReduction, &[]))
            .await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.status_message.contains("selection criteria"));
        assert_eq!(processor.created_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_selections_fail_reduction() {
        let fx = fixture().await;
        let (runner, processor) = runner(&fx, SimulationConfig::default());

        let outcome = runner
            .execute(context(
                &fx,
                TaskAction::HierarchyAndReduction,
                &[("region", "Atlantis")],
            ))
            .await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.status_message.contains("none of the 1 selected values"));
        assert!(outcome.extracted_hierarchy.is_some());
        assert_eq!(processor.created_count(), 1);
    }

    #[tokio::test]
    async fn test_extraction_start_timeout_skips_reduction() {
        let fx = fixture().await;
        let (runner, processor) = runner(&fx, SimulationConfig::default().never_starting());

        let outcome = runner
            .execute(context(
                &fx,
                TaskAction::HierarchyAndReduction,
                &[("region", "East")],
            ))
            .await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.status_message.contains("did not start"));
        assert_eq!(processor.created_count(), 1);
        assert_eq!(processor.deleted_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_extraction_output_fails_job() {
        let fx = fixture().await;
        let (runner, _) = runner(&fx, SimulationConfig::default().without_output());

        let outcome = runner
            .execute(context(&fx, TaskAction::HierarchyOnly, &[]))
            .await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.status_message.contains("extraction output missing"));
    }

    #[tokio::test]
    async fn test_sha256_file() {
        let fx = fixture().await;
        assert_eq!(sha256_file(&fx.master).await.unwrap(), fx.checksum);
    }
}
