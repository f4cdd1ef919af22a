//! Core data model: executions, step results, timers, signal waiters.
//!
//! These types are the persisted shape every [`crate::persistence::Store`]
//! implementation agrees on (§6 of the design notes: "persisted state
//! layout (any conforming store)"). They carry no store-specific logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of an [`Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Sleeping,
    WaitingForSignal,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses are absorbing (I5): only cancellation may act on
    /// them, and that action is a no-op.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn is_claimable_category(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending
                | ExecutionStatus::Retrying
                | ExecutionStatus::Sleeping
                | ExecutionStatus::WaitingForSignal
                | ExecutionStatus::Running
        )
    }
}

/// `{ message, stack? }` per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionError {
    pub message: String,
    pub stack: Option<String>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// The unit of durable work (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub task_id: String,
    pub input: Value,
    pub status: ExecutionStatus,
    pub attempt: u32,
    pub result: Option<Value>,
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Present iff a worker currently holds the lease.
    pub lease_owner: Option<String>,
    /// Opaque CAS token for the held lease, independent of `lease_owner`
    /// string equality so a renewed lease can't be confused with a stale one.
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Timestamp the scheduler must wake the execution (sleep / signal timeout).
    pub wake_at: Option<DateTime<Utc>>,
    /// Signal identifier the execution currently waits on.
    pub pending_signal_id: Option<String>,
}

impl Execution {
    pub fn new(id: Uuid, task_id: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_id: task_id.into(),
            input,
            status: ExecutionStatus::Pending,
            attempt: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            lease_owner: None,
            lease_id: None,
            lease_expires_at: None,
            wake_at: None,
            pending_signal_id: None,
        }
    }

    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lease_expires_at, Some(exp) if exp > now) && self.lease_owner.is_some()
    }
}

/// Kind of a journaled [`StepResult`] (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Step,
    Sleep,
    SignalWait,
    Switch,
}

/// Journaled outcome of a single `ctx.*` call. Composite key is
/// `(execution_id, step_id)`; never deleted except by an external purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub execution_id: Uuid,
    pub step_id: String,
    pub kind: StepKind,
    /// `None` while the row is in the `waiting` placeholder state.
    pub result: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn is_waiting(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Why a [`Timer`] was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerReason {
    Sleep,
    SignalTimeout,
}

/// Pending wake event; always redundant with the corresponding waiting
/// [`StepResult`], kept as an index for cheap "due now" queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub execution_id: Uuid,
    pub step_id: String,
    pub wake_at: DateTime<Utc>,
    pub reason: TimerReason,
}

/// A subscription row; `(signal_id, execution_id, step_id)` composite key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalWaiter {
    pub signal_id: String,
    pub execution_id: Uuid,
    pub step_id: String,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Append-only audit entry written by `ctx.note`. Deliberately outside the
/// `(execution_id, step_id)` journal key space: notes are not consulted on
/// replay and may be emitted more than once per step id across attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteEntry {
    pub execution_id: Uuid,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Filter accepted by `Store::list_executions` / `Service::list_executions`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub task_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

/// Simple offset/limit pagination, matching the teacher's `Pagination` shape.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}
