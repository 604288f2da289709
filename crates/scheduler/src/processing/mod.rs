//! External document-processing system
//!
//! The processor works asynchronously: callers create a task, ask it to
//! run, poll its status until it reports start and finish times, and
//! delete it afterwards. Nothing here blocks on completion callbacks.
//!
//! This module provides:
//! - [`DocumentProcessor`] - the create/run/poll/delete contract
//! - [`HttpDocumentProcessor`] - JSON-over-HTTP client
//! - [`SimulatedDocumentProcessor`] - in-process implementation for tests and local runs
//! - [`output`] - on-disk format of extraction output

mod http;
pub mod output;
mod simulated;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::FieldSelection;

pub use http::HttpDocumentProcessor;
pub use simulated::{SimulatedDocumentProcessor, SimulationConfig};

/// Opaque reference to a task held by the processor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteTaskRef(pub String);

impl std::fmt::Display for RemoteTaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of a remote task as reported by the processor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTaskStatus {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RemoteTaskStatus {
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Hierarchy extraction over a working copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    /// Working copy of the master content
    pub source_path: PathBuf,
    /// Directory the processor writes the field and values files into
    pub output_dir: PathBuf,
}

/// Reduction of a working copy to the selected values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionRequest {
    pub source_path: PathBuf,
    pub selections: Vec<FieldSelection>,
    /// Where the reduced artifact must be written
    pub output_path: PathBuf,
}

/// Processor errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The processor cannot be reached
    #[error("document processor unavailable: {0}")]
    Unavailable(String),

    /// The processor rejected a request
    #[error("document processor rejected request: {0}")]
    Rejected(String),

    /// The processor does not know the task
    #[error("remote task not found: {0}")]
    TaskNotFound(RemoteTaskRef),

    /// The processor answered with something unreadable
    #[error("invalid response from document processor: {0}")]
    InvalidResponse(String),
}

/// Contract of the external document-processing system
#[async_trait]
pub trait DocumentProcessor: Send + Sync + 'static {
    /// Check that the processor is reachable
    async fn ping(&self) -> Result<(), ProcessorError>;

    /// Create a hierarchy extraction task
    async fn create_extraction_task(
        &self,
        request: &ExtractionRequest,
    ) -> Result<RemoteTaskRef, ProcessorError>;

    /// Create a content reduction task
    async fn create_reduction_task(
        &self,
        request: &ReductionRequest,
    ) -> Result<RemoteTaskRef, ProcessorError>;

    /// Ask the processor to run a task
    ///
    /// Safe to call repeatedly; a busy processor may ignore the request.
    async fn run(&self, task: &RemoteTaskRef) -> Result<(), ProcessorError>;

    /// Fetch the task's start and finish times
    async fn get_status(&self, task: &RemoteTaskRef) -> Result<RemoteTaskStatus, ProcessorError>;

    /// Delete a task; returns whether the processor removed anything
    async fn delete(&self, task: &RemoteTaskRef) -> Result<bool, ProcessorError>;
}
