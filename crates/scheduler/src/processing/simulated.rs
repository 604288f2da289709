//! In-process document processor
//!
//! Behaves like the remote system from the scheduler's point of view: tasks
//! start some time after `run` is requested, finish some time after that,
//! and only then does their output appear on disk. Used by tests and for
//! local runs without a processor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::output::write_hierarchy;
use super::{
    DocumentProcessor, ExtractionRequest, ProcessorError, ReductionRequest, RemoteTaskRef,
    RemoteTaskStatus,
};
use crate::job::{ExtractedHierarchy, Field, StructureKind};

/// Behavior of the simulated processor
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Hierarchy written by extraction tasks
    pub hierarchy: ExtractedHierarchy,
    /// Delay between the first `run` request and the reported start
    pub start_delay: Duration,
    /// Delay between start and finish
    pub run_duration: Duration,
    /// Tasks never report a start time
    pub never_start: bool,
    /// Tasks start but never report a finish time
    pub never_finish: bool,
    /// Finished tasks write their output files
    pub write_output: bool,
    /// `ping` succeeds
    pub reachable: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            hierarchy: ExtractedHierarchy::new(vec![Field {
                name: "region".into(),
                display_name: "Region".into(),
                value_delimiter: "|".into(),
                structure_kind: StructureKind::Flat,
                values: vec!["East".into(), "North".into(), "West".into()],
            }]),
            start_delay: Duration::ZERO,
            run_duration: Duration::from_millis(50),
            never_start: false,
            never_finish: false,
            write_output: true,
            reachable: true,
        }
    }
}

impl SimulationConfig {
    pub fn with_hierarchy(mut self, hierarchy: ExtractedHierarchy) -> Self {
        self.hierarchy = hierarchy;
        self
    }

    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = duration;
        self
    }

    pub fn never_starting(mut self) -> Self {
        self.never_start = true;
        self
    }

    pub fn never_finishing(mut self) -> Self {
        self.never_finish = true;
        self
    }

    pub fn without_output(mut self) -> Self {
        self.write_output = false;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

#[derive(Debug, Clone)]
enum SimulatedWork {
    Extraction(ExtractionRequest),
    Reduction(ReductionRequest),
}

#[derive(Debug)]
struct SimulatedTask {
    work: SimulatedWork,
    run_requested_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Document processor that runs entirely in-process
pub struct SimulatedDocumentProcessor {
    config: SimulationConfig,
    tasks: Mutex<HashMap<RemoteTaskRef, SimulatedTask>>,
    deleted: Mutex<Vec<RemoteTaskRef>>,
    next_id: AtomicU64,
}

impl SimulatedDocumentProcessor {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of tasks created so far
    pub fn created_count(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst) - 1
    }

    /// Tasks that have been deleted, in order
    pub fn deleted_tasks(&self) -> Vec<RemoteTaskRef> {
        self.deleted.lock().clone()
    }

    /// Tasks created but not yet deleted
    pub fn live_task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn insert(&self, work: SimulatedWork) -> RemoteTaskRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = RemoteTaskRef(format!("sim-{id}"));
        self.tasks.lock().insert(
            task.clone(),
            SimulatedTask {
                work,
                run_requested_at: None,
                started_at: None,
                finished_at: None,
            },
        );
        task
    }

    /// Advance a task's clock; returns work to materialize if it just finished
    fn advance(
        &self,
        task: &RemoteTaskRef,
    ) -> Result<(RemoteTaskStatus, Option<SimulatedWork>), ProcessorError> {
        let mut tasks = self.tasks.lock();
        let state = tasks
            .get_mut(task)
            .ok_or_else(|| ProcessorError::TaskNotFound(task.clone()))?;
        let now = Utc::now();

        if state.started_at.is_none() && !self.config.never_start {
            if let Some(requested) = state.run_requested_at {
                if now >= requested + to_chrono(self.config.start_delay) {
                    state.started_at = Some(now);
                }
            }
        }

        let mut just_finished = None;
        if let (Some(started), None) = (state.started_at, state.finished_at) {
            if !self.config.never_finish && now >= started + to_chrono(self.config.run_duration)
            {
                state.finished_at = Some(now);
                just_finished = Some(state.work.clone());
            }
        }

        Ok((
            RemoteTaskStatus {
                started_at: state.started_at,
                finished_at: state.finished_at,
            },
            just_finished,
        ))
    }

    async fn materialize(&self, work: SimulatedWork) -> Result<(), ProcessorError> {
        if !self.config.write_output {
            return Ok(());
        }

        let result = match work {
            SimulatedWork::Extraction(request) => {
                write_hierarchy(&request.output_dir, &self.config.hierarchy).await
            }
            SimulatedWork::Reduction(request) => {
                if let Some(parent) = request.output_path.parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        return Err(ProcessorError::Rejected(e.to_string()));
                    }
                }
                tokio::fs::copy(&request.source_path, &request.output_path)
                    .await
                    .map(|_| ())
            }
        };

        result.map_err(|e| ProcessorError::Rejected(format!("failed to write output: {e}")))
    }
}

impl Default for SimulatedDocumentProcessor {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[async_trait]
impl DocumentProcessor for SimulatedDocumentProcessor {
    async fn ping(&self) -> Result<(), ProcessorError> {
        if self.config.reachable {
            Ok(())
        } else {
            Err(ProcessorError::Unavailable("simulated outage".into()))
        }
    }

    async fn create_extraction_task(
        &self,
        request: &ExtractionRequest,
    ) -> Result<RemoteTaskRef, ProcessorError> {
        Ok(self.insert(SimulatedWork::Extraction(request.clone())))
    }

    async fn create_reduction_task(
        &self,
        request: &ReductionRequest,
    ) -> Result<RemoteTaskRef, ProcessorError> {
        Ok(self.insert(SimulatedWork::Reduction(request.clone())))
    }

    async fn run(&self, task: &RemoteTaskRef) -> Result<(), ProcessorError> {
        let mut tasks = self.tasks.lock();
        let state = tasks
            .get_mut(task)
            .ok_or_else(|| ProcessorError::TaskNotFound(task.clone()))?;
        state.run_requested_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    async fn get_status(&self, task: &RemoteTaskRef) -> Result<RemoteTaskStatus, ProcessorError> {
        let (status, finished_work) = self.advance(task)?;
        if let Some(work) = finished_work {
            self.materialize(work).await?;
        }
        Ok(status)
    }

    async fn delete(&self, task: &RemoteTaskRef) -> Result<bool, ProcessorError> {
        let removed = self.tasks.lock().remove(task).is_some();
        if removed {
            self.deleted.lock().push(task.clone());
        }
        Ok(removed)
    }
}
