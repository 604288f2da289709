//! Job data model
//!
//! A [`Job`] is one row of the shared reduction queue. The scheduler only
//! ever moves a job `Queued -> Reducing -> {Reduced, Error}`; `Canceled` is
//! written by external actors and is never overwritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue status of a reduction job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a scheduler and executing
    Reducing,
    /// Completed successfully
    Reduced,
    /// Completed with a failure
    Error,
    /// Canceled by an external actor
    Canceled,
}

impl JobStatus {
    /// Whether no further scheduler transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reduced | Self::Error | Self::Canceled)
    }

    /// Database/text representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Reducing => "reducing",
            Self::Reduced => "reduced",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "reducing" => Ok(Self::Reducing),
            "reduced" => Ok(Self::Reduced),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// What a job asks the pipeline to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Extract the field hierarchy only
    HierarchyOnly,
    /// Extract the hierarchy and create reduced content
    HierarchyAndReduction,
}

impl TaskAction {
    /// Whether the reduction phase runs for this action
    pub fn includes_reduction(&self) -> bool {
        matches!(self, Self::HierarchyAndReduction)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HierarchyOnly => "hierarchy_only",
            Self::HierarchyAndReduction => "hierarchy_and_reduction",
        }
    }
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hierarchy_only" => Ok(Self::HierarchyOnly),
            "hierarchy_and_reduction" => Ok(Self::HierarchyAndReduction),
            other => Err(format!("unknown task action: {other}")),
        }
    }
}

/// One selected value of one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelection {
    pub field_name: String,
    pub value: String,
}

impl FieldSelection {
    pub fn new(field_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            value: value.into(),
        }
    }
}

/// How the values of a field are organized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    Flat,
    Tree,
    Unknown,
}

impl StructureKind {
    /// Parse the structure column of extraction output; unrecognized text maps to `Unknown`
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Self::Flat,
            "tree" => Self::Tree,
            _ => Self::Unknown,
        }
    }
}

/// A selectable field discovered in master content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub display_name: String,
    pub value_delimiter: String,
    pub structure_kind: StructureKind,
    pub values: Vec<String>,
}

/// Ordered list of fields produced by the extraction phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedHierarchy {
    pub fields: Vec<Field>,
}

impl ExtractedHierarchy {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether the selection names a field and value present in this hierarchy
    pub fn contains(&self, selection: &FieldSelection) -> bool {
        self.field(&selection.field_name)
            .is_some_and(|f| f.values.iter().any(|v| v == &selection.value))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A reduction job as stored in the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Selects the runner that executes this job
    pub content_type: String,
    pub master_file_path: String,
    pub master_content_checksum: String,
    pub selection_criteria: Vec<FieldSelection>,
    pub task_action: TaskAction,
    pub result_file_path: Option<String>,
    pub extracted_hierarchy: Option<ExtractedHierarchy>,
    pub status_message: Option<String>,
}

/// A job submission, before it is assigned an id and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub content_type: String,
    pub master_file_path: String,
    pub master_content_checksum: String,
    pub selection_criteria: Vec<FieldSelection>,
    pub task_action: TaskAction,
}

impl NewJob {
    pub fn new(
        content_type: impl Into<String>,
        master_file_path: impl Into<String>,
        master_content_checksum: impl Into<String>,
        task_action: TaskAction,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            master_file_path: master_file_path.into(),
            master_content_checksum: master_content_checksum.into(),
            selection_criteria: vec![],
            task_action,
        }
    }

    pub fn with_selection(mut self, selection: FieldSelection) -> Self {
        self.selection_criteria.push(selection);
        self
    }

    pub fn with_selections(mut self, selections: Vec<FieldSelection>) -> Self {
        self.selection_criteria = selections;
        self
    }

    /// Materialize a queued job
    pub fn into_job(self, id: Uuid, created_at: DateTime<Utc>) -> Job {
        Job {
            id,
            status: JobStatus::Queued,
            created_at,
            content_type: self.content_type,
            master_file_path: self.master_file_path,
            master_content_checksum: self.master_content_checksum,
            selection_criteria: self.selection_criteria,
            task_action: self.task_action,
            result_file_path: None,
            extracted_hierarchy: None,
            status_message: None,
        }
    }
}

/// Terminal result of running one job, ready to be written back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    /// Either `Reduced` or `Error`
    pub status: JobStatus,
    pub result_file_path: Option<String>,
    pub extracted_hierarchy: Option<ExtractedHierarchy>,
    pub status_message: String,
}

impl JobOutcome {
    pub fn reduced(
        job_id: Uuid,
        result_file_path: Option<String>,
        extracted_hierarchy: Option<ExtractedHierarchy>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::Reduced,
            result_file_path,
            extracted_hierarchy,
            status_message: message.into(),
        }
    }

    pub fn error(job_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            job_id,
            status: JobStatus::Error,
            result_file_path: None,
            extracted_hierarchy: None,
            status_message: message.into(),
        }
    }

    pub fn with_hierarchy(mut self, hierarchy: Option<ExtractedHierarchy>) -> Self {
        self.extracted_hierarchy = hierarchy;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Reduced
    }
}
