//! Persistence abstraction (C3): executions, step results, timers, signal
//! waiters, leases. Every operation here is logically async and may fail
//! with [`StoreError`]; atomic multi-row operations are required where
//! noted (§4.3 atomicity groups a-d).
//!
//! A reference memory implementation ([`crate::persistence::memory::InMemoryStore`])
//! achieves atomicity with a single mutex; the Postgres implementation
//! ([`crate::persistence::postgres::PostgresStore`]) uses transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::model::{
    Execution, ExecutionError, ExecutionFilter, ExecutionStatus, NoteEntry, Pagination,
    SignalWaiter, StepKind, StepResult, Timer, TimerReason,
};

/// Store-level failures. Treated as transient by the Worker for a bounded
/// number of retries, then promoted to `Failed` (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution {0} not found")]
    NotFound(Uuid),

    #[error("duplicate step id {step_id} for execution {execution_id}")]
    DuplicateStepId {
        execution_id: Uuid,
        step_id: String,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Options accepted by [`Store::claim`].
#[derive(Debug, Clone, Default)]
pub struct ClaimOptions {
    /// Restrict claiming to executions of this task, if set.
    pub task_id: Option<String>,
}

/// Successful claim: the execution plus the lease token the caller now
/// holds on it.
#[derive(Debug, Clone)]
pub struct ClaimedExecution {
    pub execution: Execution,
    pub lease_id: Uuid,
}

/// Describes what to journal for a single `ctx.*` call, plus any Timer or
/// SignalWaiter row that must be written in the same atomic group (§4.3
/// group a).
#[derive(Debug, Clone)]
pub struct StepResultWrite {
    pub execution_id: Uuid,
    pub step_id: String,
    pub kind: StepKind,
    /// `None` means "write the waiting placeholder" (sleep / signal_wait
    /// first encounter); `Some` means write the final value directly.
    pub result: Option<Value>,
    pub arm_timer: Option<Timer>,
    pub arm_waiter: Option<SignalWaiter>,
}

impl StepResultWrite {
    pub fn step(execution_id: Uuid, step_id: impl Into<String>, result: Value) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            kind: StepKind::Step,
            result: Some(result),
            arm_timer: None,
            arm_waiter: None,
        }
    }

    pub fn switch(execution_id: Uuid, step_id: impl Into<String>, branch_id: Value) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            kind: StepKind::Switch,
            result: Some(branch_id),
            arm_timer: None,
            arm_waiter: None,
        }
    }

    pub fn sleep_waiting(execution_id: Uuid, step_id: impl Into<String>, timer: Timer) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            kind: StepKind::Sleep,
            result: None,
            arm_timer: Some(timer),
            arm_waiter: None,
        }
    }

    /// `sleep(duration = 0)` never needs to wait: write the final value
    /// directly instead of a waiting placeholder.
    pub fn sleep_completed(execution_id: Uuid, step_id: impl Into<String>, result: Value) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            kind: StepKind::Sleep,
            result: Some(result),
            arm_timer: None,
            arm_waiter: None,
        }
    }

    pub fn signal_wait_waiting(
        execution_id: Uuid,
        step_id: impl Into<String>,
        waiter: SignalWaiter,
        timer: Option<Timer>,
    ) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            kind: StepKind::SignalWait,
            result: None,
            arm_timer: timer,
            arm_waiter: Some(waiter),
        }
    }

    /// `waitForSignal` with `timeoutMs = 0` when no signal is already
    /// queued ready: write the timeout outcome directly, no waiter needed.
    pub fn signal_wait_completed(
        execution_id: Uuid,
        step_id: impl Into<String>,
        result: Value,
    ) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            kind: StepKind::SignalWait,
            result: Some(result),
            arm_timer: None,
            arm_waiter: None,
        }
    }
}

/// Patch applied atomically alongside a status CAS in
/// [`Store::update_execution_status`]. `Option<Option<_>>` fields
/// distinguish "leave unchanged" (`None`) from "explicitly clear"
/// (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub result: Option<Value>,
    pub error: Option<ExecutionError>,
    pub completed_at: Option<DateTime<Utc>>,
    pub wake_at: Option<Option<DateTime<Utc>>>,
    pub pending_signal_id: Option<Option<String>>,
    pub increment_attempt: bool,
    pub clear_lease: bool,
}

/// Persistence abstraction shared by the Executor and Worker (C3).
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError>;

    async fn load_execution(&self, id: Uuid) -> Result<Execution, StoreError>;

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        paging: Pagination,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Picks an execution that is (a) pending/retrying with `wake_at <=
    /// now`, (b) sleeping with `wake_at <= now`, (c) waiting_for_signal
    /// whose waiter was marked ready or whose deadline passed, or (d)
    /// running with an expired lease; acquires its lease; sets
    /// `status = Running`. Atomicity group (c).
    async fn claim(
        &self,
        owner: &str,
        options: ClaimOptions,
    ) -> Result<Option<ClaimedExecution>, StoreError>;

    /// `true` iff the lease is still owned by the caller and was extended.
    async fn renew_lease(
        &self,
        execution_id: Uuid,
        lease_id: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn release_lease(&self, execution_id: Uuid, lease_id: Uuid) -> Result<(), StoreError>;

    /// Fails with `StoreError::DuplicateStepId` on key collision. Atomic
    /// with any Timer/SignalWaiter insert named on the write (group a).
    async fn append_step_result(&self, write: StepResultWrite) -> Result<StepResult, StoreError>;

    /// Replaces the waiting placeholder with its final value; atomic
    /// removal of the associated Timer/SignalWaiter rows (group b).
    async fn promote_waiting_step(
        &self,
        execution_id: Uuid,
        step_id: &str,
        value: Value,
    ) -> Result<StepResult, StoreError>;

    async fn list_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError>;

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>, StoreError>;

    async fn cancel_timer(&self, execution_id: Uuid, step_id: &str) -> Result<(), StoreError>;

    /// Flips all matching waiters to ready, atomically writes the payload
    /// into each corresponding StepResult, cancels paired timeout timers,
    /// returns the affected execution ids (group d).
    async fn signal_ready(&self, signal_id: &str, payload: Value) -> Result<Vec<Uuid>, StoreError>;

    /// CAS on status; used by the Worker to transition at the end of each
    /// advance.
    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<bool, StoreError>;

    /// Sets `status = cancelled` iff the current status is non-terminal
    /// (spec §4.4); a no-op returning `false` against an execution that
    /// has already reached a terminal status. Unlike
    /// `update_execution_status`, the caller names no exact `from` status
    /// since cancellation must apply uniformly across every non-terminal
    /// status.
    async fn cancel_execution(&self, execution_id: Uuid) -> Result<bool, StoreError>;

    async fn append_note(&self, note: NoteEntry) -> Result<(), StoreError>;

    async fn list_notes(&self, execution_id: Uuid) -> Result<Vec<NoteEntry>, StoreError>;
}

/// Helper retained for callers that want a ready-armed sleep timer without
/// constructing [`Timer`] by hand.
pub fn sleep_timer(execution_id: Uuid, step_id: impl Into<String>, wake_at: DateTime<Utc>) -> Timer {
    Timer {
        execution_id,
        step_id: step_id.into(),
        wake_at,
        reason: TimerReason::Sleep,
    }
}

pub fn signal_timeout_timer(
    execution_id: Uuid,
    step_id: impl Into<String>,
    wake_at: DateTime<Utc>,
) -> Timer {
    Timer {
        execution_id,
        step_id: step_id.into(),
        wake_at,
        reason: TimerReason::SignalTimeout,
    }
}
