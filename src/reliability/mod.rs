//! Reliability patterns for durable execution
//!
//! This module provides [`RetryPolicy`], the retry/backoff policy consulted
//! by the Executor when a procedure throws (spec §4.2).

mod retry;

pub use retry::{BackoffKind, RetryPolicy};
