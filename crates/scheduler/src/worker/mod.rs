//! Job execution
//!
//! This module provides:
//! - [`WorkerPool`] - bounded set of in-flight jobs with per-job cancellation
//! - [`JobPoller`] - the claim / run / write-back loop
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        JobPoller                             │
//! │   reap finished -> write_result -> claim_ready_jobs -> sleep │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │        WorkerPool (max_parallel_tasks slots)        │    │
//! │  │  [Job 1] [Job 2] ... [Job N]   one token per job    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use reduction_scheduler::worker::{JobPoller, PollerConfig};
//!
//! let config = PollerConfig::new().with_max_parallel_tasks(4);
//! let poller = JobPoller::new("poller-0", store, registry, config);
//!
//! let cancel = CancellationToken::new();
//! let handle = tokio::spawn(poller.run(cancel.clone()));
//!
//! // Graceful shutdown
//! cancel.cancel();
//! handle.await??;
//! ```

mod poller;
mod pool;

pub use poller::{JobPoller, PollerConfig, PollerError};
pub use pool::{WorkerPool, WorkerPoolError};
