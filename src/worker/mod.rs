//! Worker (C4): claims executions and drives them through the executor.
//!
//! This module provides:
//! - [`WorkerPool`] - claims executions and advances them concurrently
//! - [`ExecutionPoller`] - single-claim polling with adaptive backoff
//! - [`BackpressureConfig`] - load-aware claim acceptance configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  ┌─────────────────┐        ┌─────────────────────────────┐ │
//! │  │ ExecutionPoller │───────▶│       BackpressureState      │ │
//! │  │   (adaptive)    │        │  (high/low watermarks)       │ │
//! │  └─────────────────┘        └─────────────────────────────┘ │
//! │         │                                                    │
//! │         ▼ per claim                                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │  lease-renewal companion  +  Executor::advance       │    │
//! │  │  (Semaphore-limited, one task per claimed execution) │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use durable_workflow::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::new()
//!     .with_worker_id("order-worker-1")
//!     .with_max_concurrency(20);
//!
//! // Share one SignalBus with the Service posting signals so this pool's
//! // poller wakes immediately on a post instead of its next backoff tick.
//! let pool = WorkerPool::new(store, executor, signal_bus, config);
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod backpressure;
mod poller;
mod pool;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use poller::{ExecutionPoller, PollerConfig, PollerError};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
