//! Reference in-memory [`Store`] implementation, backing the unit and
//! property test suites. Atomicity is achieved with a single
//! `parking_lot::RwLock` guarding all tables, exactly as the teacher's
//! `InMemoryWorkflowEventStore` does for its event log.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::model::{
    Execution, ExecutionFilter, ExecutionStatus, NoteEntry, Pagination, SignalWaiter, StepResult,
    Timer,
};

use super::store::{ClaimOptions, ClaimedExecution, ExecutionPatch, Store, StoreError, StepResultWrite};

/// Internal bookkeeping kept alongside an [`Execution`] that has no
/// counterpart in the public data model: the timestamp a waiting signal
/// was marked ready, used to order claims by arrival (spec §4.3).
#[derive(Clone)]
struct ExecutionRecord {
    execution: Execution,
    signal_ready_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    executions: HashMap<Uuid, ExecutionRecord>,
    step_results: HashMap<(Uuid, String), StepResult>,
    timers: HashMap<(Uuid, String), Timer>,
    signal_waiters: HashMap<String, Vec<SignalWaiter>>,
    notes: HashMap<Uuid, Vec<NoteEntry>>,
}

/// In-memory, single-process implementation of [`Store`].
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.executions.insert(
            execution.id,
            ExecutionRecord {
                execution,
                signal_ready_at: None,
            },
        );
        Ok(())
    }

    async fn load_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.state
            .read()
            .executions
            .get(&id)
            .map(|r| r.execution.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        paging: Pagination,
    ) -> Result<Vec<Execution>, StoreError> {
        let state = self.state.read();
        let mut matched: Vec<Execution> = state
            .executions
            .values()
            .map(|r| r.execution.clone())
            .filter(|e| {
                filter
                    .task_id
                    .as_ref()
                    .map(|t| t == &e.task_id)
                    .unwrap_or(true)
                    && filter.status.map(|s| s == e.status).unwrap_or(true)
            })
            .collect();
        matched.sort_by_key(|e| e.created_at);
        Ok(matched
            .into_iter()
            .skip(paging.offset)
            .take(paging.limit)
            .collect())
    }

    #[instrument(skip(self, options), fields(owner = %owner))]
    async fn claim(
        &self,
        owner: &str,
        options: ClaimOptions,
    ) -> Result<Option<ClaimedExecution>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();

        // Tier 0: due timers (sleep or signal_timeout), ascending wake_at.
        let mut due_timer_execs: Vec<(DateTime<Utc>, Uuid)> = state
            .timers
            .values()
            .filter(|t| t.wake_at <= now)
            .map(|t| (t.wake_at, t.execution_id))
            .collect();
        due_timer_execs.sort_by_key(|(wake_at, id)| (*wake_at, *id));

        // Tier 1: signaled executions, arrival order.
        let mut signaled: Vec<(DateTime<Utc>, Uuid)> = state
            .executions
            .values()
            .filter_map(|r| {
                r.signal_ready_at
                    .map(|ready_at| (ready_at, r.execution.id))
            })
            .collect();
        signaled.sort_by_key(|(ready_at, id)| (*ready_at, *id));

        // Tier 2: plain pending/retrying due now, by createdAt.
        let mut pending: Vec<(DateTime<Utc>, Uuid)> = state
            .executions
            .values()
            .filter(|r| {
                matches!(
                    r.execution.status,
                    ExecutionStatus::Pending | ExecutionStatus::Retrying
                ) && r.execution.wake_at.map(|w| w <= now).unwrap_or(true)
            })
            .map(|r| (r.execution.created_at, r.execution.id))
            .collect();
        pending.sort_by_key(|(created_at, id)| (*created_at, *id));

        // Tier 3: expired-lease recoveries.
        let mut expired: Vec<(DateTime<Utc>, Uuid)> = state
            .executions
            .values()
            .filter(|r| {
                r.execution.status == ExecutionStatus::Running
                    && r.execution
                        .lease_expires_at
                        .map(|exp| exp <= now)
                        .unwrap_or(false)
            })
            .map(|r| (r.execution.lease_expires_at.unwrap(), r.execution.id))
            .collect();
        expired.sort_by_key(|(exp, id)| (*exp, *id));

        let candidate_ids: Vec<Uuid> = due_timer_execs
            .into_iter()
            .map(|(_, id)| id)
            .chain(signaled.into_iter().map(|(_, id)| id))
            .chain(pending.into_iter().map(|(_, id)| id))
            .chain(expired.into_iter().map(|(_, id)| id))
            .collect();

        for id in candidate_ids {
            let matches_task = options
                .task_id
                .as_ref()
                .map(|t| {
                    state
                        .executions
                        .get(&id)
                        .map(|r| &r.execution.task_id == t)
                        .unwrap_or(false)
                })
                .unwrap_or(true);
            if !matches_task {
                continue;
            }

            let record = state.executions.get_mut(&id).expect("candidate id exists");
            if record.execution.status.is_terminal() {
                continue;
            }

            let lease_id = Uuid::now_v7();
            let ttl = chrono::Duration::seconds(30);
            record.execution.status = ExecutionStatus::Running;
            record.execution.lease_owner = Some(owner.to_string());
            record.execution.lease_id = Some(lease_id);
            record.execution.lease_expires_at = Some(now + ttl);
            record.execution.updated_at = now;
            record.signal_ready_at = None;

            debug!(execution_id = %id, %lease_id, "claimed execution");
            return Ok(Some(ClaimedExecution {
                execution: record.execution.clone(),
                lease_id,
            }));
        }

        Ok(None)
    }

    async fn renew_lease(
        &self,
        execution_id: Uuid,
        lease_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let Some(record) = state.executions.get_mut(&execution_id) else {
            return Ok(false);
        };
        if record.execution.lease_id != Some(lease_id) {
            return Ok(false);
        }
        let now = Utc::now();
        if record
            .execution
            .lease_expires_at
            .map(|exp| exp <= now)
            .unwrap_or(true)
        {
            return Ok(false);
        }
        record.execution.lease_expires_at =
            Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
        Ok(true)
    }

    async fn release_lease(&self, execution_id: Uuid, lease_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(record) = state.executions.get_mut(&execution_id) {
            if record.execution.lease_id == Some(lease_id) {
                record.execution.lease_owner = None;
                record.execution.lease_id = None;
                record.execution.lease_expires_at = None;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, write), fields(execution_id = %write.execution_id, step_id = %write.step_id))]
    async fn append_step_result(&self, write: StepResultWrite) -> Result<StepResult, StoreError> {
        let mut state = self.state.write();
        let key = (write.execution_id, write.step_id.clone());
        if state.step_results.contains_key(&key) {
            warn!("duplicate step id on append");
            return Err(StoreError::DuplicateStepId {
                execution_id: write.execution_id,
                step_id: write.step_id,
            });
        }

        let completed_at = write.result.is_some().then(Utc::now);
        let step_result = StepResult {
            execution_id: write.execution_id,
            step_id: write.step_id.clone(),
            kind: write.kind,
            result: write.result,
            completed_at,
        };
        state.step_results.insert(key, step_result.clone());

        if let Some(timer) = write.arm_timer {
            state
                .timers
                .insert((timer.execution_id, timer.step_id.clone()), timer);
        }
        if let Some(waiter) = write.arm_waiter {
            state
                .signal_waiters
                .entry(waiter.signal_id.clone())
                .or_default()
                .push(waiter);
        }

        Ok(step_result)
    }

    async fn promote_waiting_step(
        &self,
        execution_id: Uuid,
        step_id: &str,
        value: Value,
    ) -> Result<StepResult, StoreError> {
        let mut state = self.state.write();
        let key = (execution_id, step_id.to_string());
        let existing = state
            .step_results
            .get_mut(&key)
            .ok_or(StoreError::NotFound(execution_id))?;
        existing.result = Some(value);
        existing.completed_at = Some(Utc::now());
        let promoted = existing.clone();

        state.timers.remove(&key);
        for waiters in state.signal_waiters.values_mut() {
            waiters.retain(|w| !(w.execution_id == execution_id && w.step_id == step_id));
        }

        Ok(promoted)
    }

    async fn list_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        Ok(self
            .state
            .read()
            .step_results
            .values()
            .filter(|sr| sr.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>, StoreError> {
        Ok(self
            .state
            .read()
            .timers
            .values()
            .filter(|t| t.wake_at <= now)
            .cloned()
            .collect())
    }

    async fn cancel_timer(&self, execution_id: Uuid, step_id: &str) -> Result<(), StoreError> {
        self.state
            .write()
            .timers
            .remove(&(execution_id, step_id.to_string()));
        Ok(())
    }

    #[instrument(skip(self, payload), fields(%signal_id))]
    async fn signal_ready(&self, signal_id: &str, payload: Value) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();
        let waiters = state.signal_waiters.remove(signal_id).unwrap_or_default();
        let now = Utc::now();
        let mut affected = Vec::new();

        for waiter in waiters {
            let key = (waiter.execution_id, waiter.step_id.clone());
            if let Some(step_result) = state.step_results.get_mut(&key) {
                if !step_result.is_waiting() {
                    // Already delivered to / timed out; a late post to the
                    // same waiter is dropped, not buffered (spec §9 open
                    // question, resolved in DESIGN.md).
                    continue;
                }
                step_result.result = Some(
                    serde_json::json!({ "kind": "signal", "data": payload.clone() }),
                );
                step_result.completed_at = Some(now);
                state.timers.remove(&key);
                if let Some(record) = state.executions.get_mut(&waiter.execution_id) {
                    record.signal_ready_at = Some(now);
                }
                affected.push(waiter.execution_id);
            }
        }

        debug!(delivered = affected.len(), "signal delivered");
        Ok(affected)
    }

    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let Some(record) = state.executions.get_mut(&execution_id) else {
            return Ok(false);
        };

        // (I5) terminal statuses are absorbing; only cancellation may act
        // on them, and that is a no-op.
        if record.execution.status.is_terminal() {
            return Ok(to == ExecutionStatus::Cancelled && from == record.execution.status);
        }

        if record.execution.status != from {
            return Ok(false);
        }

        record.execution.status = to;
        if let Some(result) = patch.result {
            record.execution.result = Some(result);
        }
        if let Some(error) = patch.error {
            record.execution.error = Some(error);
        }
        if let Some(completed_at) = patch.completed_at {
            record.execution.completed_at = Some(completed_at);
        }
        if let Some(wake_at) = patch.wake_at {
            record.execution.wake_at = wake_at;
        }
        if let Some(pending_signal_id) = patch.pending_signal_id {
            record.execution.pending_signal_id = pending_signal_id;
        }
        if patch.increment_attempt {
            record.execution.attempt += 1;
        }
        if patch.clear_lease {
            record.execution.lease_owner = None;
            record.execution.lease_id = None;
            record.execution.lease_expires_at = None;
        }
        record.execution.updated_at = Utc::now();

        Ok(true)
    }

    async fn cancel_execution(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let Some(record) = state.executions.get_mut(&execution_id) else {
            return Ok(false);
        };
        if record.execution.status.is_terminal() {
            return Ok(false);
        }
        record.execution.status = ExecutionStatus::Cancelled;
        record.execution.completed_at.get_or_insert_with(Utc::now);
        record.execution.lease_owner = None;
        record.execution.lease_id = None;
        record.execution.lease_expires_at = None;
        record.execution.updated_at = Utc::now();
        Ok(true)
    }

    async fn append_note(&self, note: NoteEntry) -> Result<(), StoreError> {
        self.state
            .write()
            .notes
            .entry(note.execution_id)
            .or_default()
            .push(note);
        Ok(())
    }

    async fn list_notes(&self, execution_id: Uuid) -> Result<Vec<NoteEntry>, StoreError> {
        Ok(self
            .state
            .read()
            .notes
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }
}
