//! Persistence layer for the reduction queue
//!
//! This module provides:
//! - [`TaskQueueStore`] trait for claiming jobs and writing results
//! - [`InMemoryTaskQueueStore`] for testing
//! - [`PostgresTaskQueueStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTaskQueueStore;
pub use postgres::PostgresTaskQueueStore;
pub use store::{StoreError, TaskQueueStore, WriteOutcome};
