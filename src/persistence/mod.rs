//! Persistence layer for durable execution (C3).
//!
//! This module provides:
//! - [`Store`] trait for execution, step result, timer, and signal persistence
//! - [`InMemoryStore`] for tests and single-process deployments
//! - [`PostgresStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    sleep_timer, signal_timeout_timer, ClaimOptions, ClaimedExecution, ExecutionPatch, Store,
    StepResultWrite, StoreError,
};
