//! # Content Reduction Scheduler
//!
//! A queue-driven background scheduler that turns large master content
//! artifacts into reduced, per-audience variants.
//!
//! ## Features
//!
//! - **Exclusive claiming**: jobs move `Queued -> Reducing` atomically, oldest first, never twice
//! - **Bounded concurrency**: each poller runs at most `max_parallel_tasks` jobs
//! - **Phase pipeline**: validate, set up, extract the field hierarchy, reduce, publish, clean up
//! - **Remote processing**: create/run/poll/delete against an asynchronous document processor
//! - **Graceful stop**: running jobs are canceled and drained within a bounded wait
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Supervisor                            │
//! │  (starts pollers, health checks, fatal on poller fault)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 JobPoller  +  WorkerPool                     │
//! │  (claims jobs, runs them concurrently, writes results)      │
//! └─────────────────────────────────────────────────────────────┘
//!               │                                │
//!               ▼                                ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────┐
//! │      TaskQueueStore        │   │  JobRunner (per content)    │
//! │ (PostgreSQL or in-memory)  │   │  -> DocumentProcessor       │
//! └───────────────────────────┘   └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use reduction_scheduler::prelude::*;
//!
//! let store = Arc::new(PostgresTaskQueueStore::connect(&database_url).await?);
//! let processor = Arc::new(HttpDocumentProcessor::new("http://processor:8080")?);
//!
//! let registry = RunnerRegistry::new().with_runner(ContentReductionRunner::new(
//!     "qlikview",
//!     processor,
//!     PipelineConfig::new().with_distribution_root("/srv/reduced"),
//! ));
//!
//! let supervisor = Supervisor::new(
//!     store,
//!     registry,
//!     PollerConfig::default(),
//!     SupervisorConfig::default(),
//! );
//! supervisor.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

pub mod config;
pub mod job;
pub mod persistence;
pub mod pipeline;
pub mod processing;
pub mod reliability;
pub mod supervisor;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, ProcessorEndpoint, SchedulerConfig};
    pub use crate::job::{
        ExtractedHierarchy, Field, FieldSelection, Job, JobOutcome, JobStatus, NewJob,
        StructureKind, TaskAction,
    };
    pub use crate::persistence::{
        InMemoryTaskQueueStore, PostgresTaskQueueStore, StoreError, TaskQueueStore, WriteOutcome,
    };
    pub use crate::pipeline::{
        ContentReductionRunner, JobContext, JobRunner, PipelineConfig, PipelineError,
        RemoteTaskTimeouts, RunnerRegistry,
    };
    pub use crate::processing::{
        DocumentProcessor, HttpDocumentProcessor, ProcessorError, SimulatedDocumentProcessor,
        SimulationConfig,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::supervisor::{Health, Supervisor, SupervisorConfig, SupervisorError};
    pub use crate::worker::{JobPoller, PollerConfig, PollerError, WorkerPool, WorkerPoolError};
}

// Re-export key types at crate root
pub use config::{ConfigError, ProcessorEndpoint, SchedulerConfig};
pub use job::{Job, JobOutcome, JobStatus, NewJob, TaskAction};
pub use persistence::{InMemoryTaskQueueStore, PostgresTaskQueueStore, StoreError, TaskQueueStore};
pub use pipeline::{ContentReductionRunner, JobRunner, PipelineConfig, RunnerRegistry};
pub use processing::{DocumentProcessor, HttpDocumentProcessor, SimulatedDocumentProcessor};
pub use reliability::RetryPolicy;
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};
pub use worker::{JobPoller, PollerConfig, WorkerPool};
