//! Reliability patterns for job execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Bounded retry with linear backoff

mod retry;

pub use retry::RetryPolicy;
