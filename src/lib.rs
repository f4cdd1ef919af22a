//! # Durable Workflow Engine
//!
//! A pluggable-store engine for crash-recoverable, resumable execution of
//! ordinary async procedures via deterministic replay.
//!
//! ## Features
//!
//! - **Deterministic replay**: a procedure is re-invoked from the top on
//!   every attempt; already-journaled `ctx.*` calls short-circuit instead
//!   of re-executing.
//! - **Pluggable checkpoint store**: an in-memory reference implementation
//!   for tests, a PostgreSQL implementation for production, both
//!   conforming to the same atomicity guarantees.
//! - **Lease-based scheduling**: workers CAS a lease onto an execution
//!   before advancing it; no shared memory is required for correctness.
//! - **Signals**: named external events delivered durably via the Store
//!   and woken immediately in-process via `SignalBus`.
//! - **Configurable retries**: linear/exponential backoff with jitter,
//!   attached per procedure.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Executor                             │
//! │  (re-invokes a procedure, replaying its journal via Context) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                            Store                              │
//! │  (executions, step_results, timers, signal_waiters: memory   │
//! │   or Postgres)                                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                            │
//! │  (claims executions, renews leases, drives advance())       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_workflow::prelude::*;
//!
//! struct ProcessOrder;
//!
//! #[async_trait::async_trait]
//! impl WorkflowProcedure for ProcessOrder {
//!     const TASK_ID: &'static str = "process_order";
//!     type Input = OrderInput;
//!     type Output = OrderResult;
//!
//!     async fn run(&self, ctx: WorkflowContext, input: Self::Input) -> Result<Self::Output, WorkflowRunError> {
//!         let charge = ctx.step("charge_card", || async { charge(&input).await }).await?;
//!         ctx.sleep(None, std::time::Duration::from_secs(1)).await?;
//!         Ok(OrderResult { charge })
//!     }
//! }
//! ```

pub mod context;
pub mod engine;
pub mod model;
pub mod persistence;
pub mod procedure;
pub mod reliability;
pub mod serializer;
pub mod service;
pub mod signal;
pub mod worker;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::context::{
        Branch, SignalDef, SignalOutcome, StepOutline, SuspendReason, WaitForSignalOptions,
        WorkflowContext, WorkflowRunError,
    };
    pub use crate::engine::{Executor, ExecutorConfig, ExecutorError, Outcome, RetryAdvice};
    pub use crate::model::{
        Execution, ExecutionError, ExecutionFilter, ExecutionStatus, NoteEntry, Pagination,
        SignalWaiter, StepKind, StepResult, Timer, TimerReason,
    };
    pub use crate::persistence::{
        ClaimOptions, ClaimedExecution, ExecutionPatch, InMemoryStore, PostgresStore, Store,
        StepResultWrite, StoreError,
    };
    pub use crate::procedure::{AnyProcedure, ProcedureRegistry, RegistryError, WorkflowProcedure};
    pub use crate::reliability::{BackoffKind, RetryPolicy};
    pub use crate::serializer::{JsonSerializer, Serializer, SerializerError};
    pub use crate::service::{Service, ServiceError, StartAndWaitResult, WaitOptions};
    pub use crate::signal::{Signal, SignalBus};
    pub use crate::worker::{
        BackpressureConfig, BackpressureState, ExecutionPoller, PollerConfig, WorkerPool,
        WorkerPoolConfig, WorkerPoolError,
    };
}

// Re-export key types at crate root, mirroring the prelude for callers
// who prefer `durable_workflow::Executor` over the prelude glob.
pub use context::{SuspendReason, WorkflowContext, WorkflowRunError};
pub use engine::{Executor, ExecutorConfig, ExecutorError, Outcome, RetryAdvice};
pub use model::{Execution, ExecutionError, ExecutionStatus};
pub use persistence::{InMemoryStore, PostgresStore, Store, StoreError};
pub use procedure::{ProcedureRegistry, RegistryError, WorkflowProcedure};
pub use reliability::RetryPolicy;
pub use serializer::{JsonSerializer, Serializer};
pub use service::{Service, ServiceError};
pub use signal::SignalBus;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
