//! WorkflowContext (C1): the API exposed to user procedures. Each call
//! consults or appends to the journal so that re-invoking the procedure
//! from the top after a crash fast-forwards past everything already
//! journaled.
//!
//! Grounded on the short-circuit-on-replay pattern of a step-state cache
//! consulted before re-running side effects; suspension is reified as a
//! normal `Result` value per the design note in spec §9 rather than as a
//! thrown exception, since Rust has no cheap stack-unwinding sentinel for
//! coroutine suspension.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{SignalWaiter, StepKind, StepResult};
use crate::persistence::{store, Store, StoreError};

/// The internal control-flow sentinel: the current attempt cannot make
/// further progress without an external event (timer or signal).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SuspendReason {
    Sleep {
        wake_at: DateTime<Utc>,
    },
    Signal {
        signal_id: String,
        deadline: Option<DateTime<Utc>>,
    },
}

/// Error surface of every `ctx.*` call, propagated with `?` so a suspend
/// unwinds the user procedure back to the Executor exactly like a thrown
/// exception would in the original design.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowRunError {
    #[error("suspended")]
    Suspended(SuspendReason),

    #[error("user step failed: {0}")]
    Failed(#[source] anyhow::Error),

    #[error("non-determinism detected at step {step_id}: journaled kind {journaled:?}, current call {current:?}")]
    NonDeterminism {
        step_id: String,
        journaled: StepKind,
        current: StepKind,
    },

    #[error("duplicate step id {0} journaled twice in one execution")]
    DuplicateStepId(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Tagged union returned by [`WorkflowContext::wait_for_signal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalOutcome<T> {
    Signal { data: T },
    Timeout,
}

/// Typed handle naming a signal; `T` is the payload shape delivered to
/// [`WorkflowContext::wait_for_signal`].
#[derive(Debug, Clone)]
pub struct SignalDef<T> {
    pub id: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SignalDef<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            _marker: PhantomData,
        }
    }
}

/// Options accepted by `waitForSignal` (spec §6).
#[derive(Debug, Clone)]
pub struct WaitForSignalOptions {
    pub step_id: String,
    pub timeout_ms: Option<u64>,
}

/// One arm of a `ctx.switch`. `matches` is pure data evaluation (always
/// safe to run even in describe mode); `run` is the branch body and is
/// skipped in describe mode.
pub struct Branch<D, T> {
    pub id: String,
    pub matches: Box<dyn Fn(&D) -> bool + Send + Sync>,
    pub run: Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>,
}

impl<D, T> Branch<D, T> {
    pub fn new<M, F, Fut>(id: impl Into<String>, matches: M, run: F) -> Self
    where
        M: Fn(&D) -> bool + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            id: id.into(),
            matches: Box::new(matches),
            run: Box::new(move || Box::pin(run())),
        }
    }
}

/// Whether a [`WorkflowContext`] is advancing a real attempt or running a
/// dry structural analysis for `Service::describe`.
#[derive(Clone)]
pub enum Mode {
    Replay,
    Describe(Arc<RwLock<StepOutline>>),
}

/// One entry of the structural description `Service::describe` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutlineEntry {
    pub step_id: String,
    pub kind: StepKind,
    pub chosen_branch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutline {
    pub steps: Vec<StepOutlineEntry>,
}

/// The handle passed to a user procedure. Preloads the journal for this
/// execution once per attempt and short-circuits any call whose stepId
/// already has a final journaled result.
pub struct WorkflowContext {
    execution_id: Uuid,
    store: Arc<dyn Store>,
    journal: RwLock<HashMap<String, StepResult>>,
    mode: Mode,
}

impl WorkflowContext {
    pub fn new(execution_id: Uuid, store: Arc<dyn Store>, preloaded: Vec<StepResult>) -> Self {
        let journal = preloaded
            .into_iter()
            .map(|sr| (sr.step_id.clone(), sr))
            .collect();
        Self {
            execution_id,
            store,
            journal: RwLock::new(journal),
            mode: Mode::Replay,
        }
    }

    pub fn describe(execution_id: Uuid, store: Arc<dyn Store>, outline: Arc<RwLock<StepOutline>>) -> Self {
        Self {
            execution_id,
            store,
            journal: RwLock::new(HashMap::new()),
            mode: Mode::Describe(outline),
        }
    }

    fn is_describing(&self) -> bool {
        matches!(self.mode, Mode::Describe(_))
    }

    fn record_outline(&self, step_id: &str, kind: StepKind, chosen_branch: Option<String>) {
        if let Mode::Describe(outline) = &self.mode {
            outline.write().steps.push(StepOutlineEntry {
                step_id: step_id.to_string(),
                kind,
                chosen_branch,
            });
        }
    }

    fn cached(&self, step_id: &str) -> Option<StepResult> {
        self.journal.read().get(step_id).cloned()
    }

    /// `step<T>(stepId, fn)`: returns the journaled result if present and
    /// final, otherwise invokes `fn`, journals its return value, and
    /// returns it. If `fn` fails, nothing is persisted so the step reruns
    /// from scratch on the next attempt.
    pub async fn step<T, F, Fut, E>(&self, step_id: &str, f: F) -> Result<T, WorkflowRunError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        if let Some(existing) = self.cached(step_id) {
            if existing.kind != StepKind::Step {
                return Err(WorkflowRunError::NonDeterminism {
                    step_id: step_id.to_string(),
                    journaled: existing.kind,
                    current: StepKind::Step,
                });
            }
            let value = existing
                .result
                .ok_or_else(|| WorkflowRunError::DuplicateStepId(step_id.to_string()))?;
            return Ok(serde_json::from_value(value).map_err(|e| {
                WorkflowRunError::Failed(anyhow::anyhow!("failed to decode step {step_id}: {e}"))
            })?);
        }

        if self.is_describing() {
            self.record_outline(step_id, StepKind::Step, None);
            return Err(WorkflowRunError::Failed(anyhow::anyhow!(
                "describe mode does not execute step bodies; caller must supply defaults downstream of step `{step_id}`"
            )));
        }

        let value = f().await.map_err(|e| WorkflowRunError::Failed(e.into()))?;
        let encoded = serde_json::to_value(&value).map_err(|e| {
            WorkflowRunError::Failed(anyhow::anyhow!("failed to encode step {step_id}: {e}"))
        })?;

        let write = store::StepResultWrite::step(self.execution_id, step_id, encoded);
        let persisted = self.store.append_step_result(write).await?;
        self.journal
            .write()
            .insert(step_id.to_string(), persisted);
        Ok(value)
    }

    /// `sleep(stepId, durationMs)`. First encounter arms a timer and
    /// suspends; replay after wake promotes the waiting placeholder once
    /// `now >= wakeAt`.
    pub async fn sleep(&self, step_id: &str, duration: StdDuration) -> Result<(), WorkflowRunError> {
        if let Some(existing) = self.cached(step_id) {
            if existing.kind != StepKind::Sleep {
                return Err(WorkflowRunError::NonDeterminism {
                    step_id: step_id.to_string(),
                    journaled: existing.kind,
                    current: StepKind::Sleep,
                });
            }
            if !existing.is_waiting() {
                return Ok(());
            }
            let wake_at = wake_at_of(&existing)?;
            if Utc::now() >= wake_at {
                let promoted = self
                    .store
                    .promote_waiting_step(
                        self.execution_id,
                        step_id,
                        serde_json::json!({ "wakeAt": wake_at }),
                    )
                    .await?;
                self.journal.write().insert(step_id.to_string(), promoted);
                return Ok(());
            }
            return Err(WorkflowRunError::Suspended(SuspendReason::Sleep { wake_at }));
        }

        if self.is_describing() {
            self.record_outline(step_id, StepKind::Sleep, None);
            return Ok(());
        }

        let wake_at = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        if duration.is_zero() {
            // sleep(0) suspends exactly zero times in steady state.
            let write = store::StepResultWrite::sleep_completed(
                self.execution_id,
                step_id,
                serde_json::json!({ "wakeAt": wake_at }),
            );
            let persisted = self.store.append_step_result(write).await?;
            self.journal
                .write()
                .insert(step_id.to_string(), persisted);
            return Ok(());
        }

        let timer = store::sleep_timer(self.execution_id, step_id, wake_at);
        let write = store::StepResultWrite::sleep_waiting(self.execution_id, step_id, timer);
        let persisted = self.store.append_step_result(write).await?;
        self.journal
            .write()
            .insert(step_id.to_string(), persisted);
        Err(WorkflowRunError::Suspended(SuspendReason::Sleep { wake_at }))
    }

    /// `waitForSignal(signalDef, { stepId, timeoutMs? })`.
    pub async fn wait_for_signal<T: DeserializeOwned>(
        &self,
        signal: &SignalDef<T>,
        opts: WaitForSignalOptions,
    ) -> Result<SignalOutcome<T>, WorkflowRunError> {
        let step_id = opts.step_id.as_str();

        if let Some(existing) = self.cached(step_id) {
            if existing.kind != StepKind::SignalWait {
                return Err(WorkflowRunError::NonDeterminism {
                    step_id: step_id.to_string(),
                    journaled: existing.kind,
                    current: StepKind::SignalWait,
                });
            }
            if !existing.is_waiting() {
                return decode_signal_outcome(existing.result);
            }
            let deadline = waiting_deadline(&existing);
            if let Some(deadline) = deadline {
                if Utc::now() >= deadline {
                    let promoted = self
                        .store
                        .promote_waiting_step(
                            self.execution_id,
                            step_id,
                            serde_json::json!({ "kind": "timeout" }),
                        )
                        .await?;
                    self.journal.write().insert(step_id.to_string(), promoted);
                    return Ok(SignalOutcome::Timeout);
                }
            }
            return Err(WorkflowRunError::Suspended(SuspendReason::Signal {
                signal_id: signal.id.clone(),
                deadline,
            }));
        }

        if self.is_describing() {
            self.record_outline(step_id, StepKind::SignalWait, None);
            return Ok(SignalOutcome::Timeout);
        }

        let deadline = opts
            .timeout_ms
            .map(|ms| Utc::now() + chrono::Duration::milliseconds(ms as i64));

        if opts.timeout_ms == Some(0) {
            // timeoutMs = 0 must immediately produce {kind:"timeout"} unless
            // already queued ready, which the cache-hit branch above covers.
            let write = store::StepResultWrite::signal_wait_completed(
                self.execution_id,
                step_id,
                serde_json::json!({ "kind": "timeout" }),
            );
            let persisted = self.store.append_step_result(write).await?;
            self.journal
                .write()
                .insert(step_id.to_string(), persisted);
            return Ok(SignalOutcome::Timeout);
        }

        let waiter = SignalWaiter {
            signal_id: signal.id.clone(),
            execution_id: self.execution_id,
            step_id: step_id.to_string(),
            created_at: Utc::now(),
            deadline,
        };
        let timer = deadline.map(|d| store::signal_timeout_timer(self.execution_id, step_id, d));
        let write = store::StepResultWrite::signal_wait_waiting(
            self.execution_id,
            step_id,
            waiter,
            timer,
        );
        let persisted = self.store.append_step_result(write).await?;
        self.journal
            .write()
            .insert(step_id.to_string(), persisted);
        Err(WorkflowRunError::Suspended(SuspendReason::Signal {
            signal_id: signal.id.clone(),
            deadline,
        }))
    }

    /// `switch(stepId, discriminator, branches[])`. Branch selection is
    /// journaled under `stepId`; the chosen branch's `run` outcome is
    /// journaled under `stepId/branchId` by delegating to [`Self::step`],
    /// which already implements replay short-circuiting.
    pub async fn switch<D, T>(
        &self,
        step_id: &str,
        discriminator: &D,
        branches: Vec<Branch<D, T>>,
    ) -> Result<T, WorkflowRunError>
    where
        T: Serialize + DeserializeOwned,
    {
        let branch_id = if let Some(existing) = self.cached(step_id) {
            if existing.kind != StepKind::Switch {
                return Err(WorkflowRunError::NonDeterminism {
                    step_id: step_id.to_string(),
                    journaled: existing.kind,
                    current: StepKind::Switch,
                });
            }
            let value = existing
                .result
                .ok_or_else(|| WorkflowRunError::DuplicateStepId(step_id.to_string()))?;
            value
                .get("branch")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    WorkflowRunError::Failed(anyhow::anyhow!(
                        "corrupt switch journal entry at {step_id}"
                    ))
                })?
        } else {
            let chosen = branches
                .iter()
                .find(|b| (b.matches)(discriminator))
                .map(|b| b.id.clone())
                .ok_or_else(|| {
                    WorkflowRunError::Failed(anyhow::anyhow!(
                        "no switch branch matched at {step_id}"
                    ))
                })?;

            if self.is_describing() {
                self.record_outline(step_id, StepKind::Switch, Some(chosen.clone()));
            } else {
                let write = store::StepResultWrite::switch(
                    self.execution_id,
                    step_id,
                    serde_json::json!({ "branch": chosen }),
                );
                let persisted = self.store.append_step_result(write).await?;
                self.journal
                    .write()
                    .insert(step_id.to_string(), persisted);
            }
            chosen
        };

        let branch = branches
            .into_iter()
            .find(|b| b.id == branch_id)
            .ok_or_else(|| {
                WorkflowRunError::Failed(anyhow::anyhow!(
                    "journaled branch `{branch_id}` no longer declared at {step_id}"
                ))
            })?;

        let nested_step_id = format!("{step_id}/{branch_id}");
        if self.is_describing() {
            // describe mode never executes branch bodies.
            self.record_outline(&nested_step_id, StepKind::Step, None);
            return Err(WorkflowRunError::Failed(anyhow::anyhow!(
                "describe mode does not execute switch branch bodies"
            )));
        }
        self.step(&nested_step_id, move || (branch.run)()).await
    }

    /// `note(message)`: append-only audit entry, never consulted on
    /// replay, outside the `(execId, stepId)` journal key space.
    pub async fn note(&self, message: impl Into<String>) -> Result<(), WorkflowRunError> {
        let message = message.into();
        if self.is_describing() {
            return Ok(());
        }
        self.store
            .append_note(crate::model::NoteEntry {
                execution_id: self.execution_id,
                message,
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Snapshot of everything journaled so far this attempt, used by the
    /// Executor to decide completion vs. suspension bookkeeping.
    pub fn journaled_step_ids(&self) -> Vec<String> {
        self.journal.read().keys().cloned().collect()
    }
}

fn wake_at_of(existing: &StepResult) -> Result<DateTime<Utc>, WorkflowRunError> {
    existing
        .result
        .as_ref()
        .and_then(|v| v.get("wakeAt"))
        .cloned()
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok())
        .ok_or_else(|| {
            WorkflowRunError::Failed(anyhow::anyhow!("sleep waiting entry missing wakeAt"))
        })
}

fn waiting_deadline(existing: &StepResult) -> Option<DateTime<Utc>> {
    existing
        .result
        .as_ref()
        .and_then(|v| v.get("deadline"))
        .cloned()
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok())
}

fn decode_signal_outcome<T: DeserializeOwned>(
    value: Option<Value>,
) -> Result<SignalOutcome<T>, WorkflowRunError> {
    let value = value.ok_or_else(|| {
        WorkflowRunError::Failed(anyhow::anyhow!("promoted signal_wait entry had no value"))
    })?;
    serde_json::from_value(value)
        .map_err(|e| WorkflowRunError::Failed(anyhow::anyhow!("failed to decode signal outcome: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    #[tokio::test]
    async fn step_short_circuits_on_replay() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let exec_id = Uuid::now_v7();
        store
            .create_execution(crate::model::Execution::new(exec_id, "t", Value::Null))
            .await
            .unwrap();

        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        {
            let calls = calls.clone();
            let ctx = WorkflowContext::new(exec_id, store.clone(), vec![]);
            let value: u32 = ctx
                .step("s1", || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(42)
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }

        let preloaded = store.list_step_results(exec_id).await.unwrap();
        {
            let calls = calls.clone();
            let ctx = WorkflowContext::new(exec_id, store.clone(), preloaded);
            let value: u32 = ctx
                .step("s1", || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(999)
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, 42, "replay must return the journaled value");
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_determinism_is_detected_on_kind_mismatch() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let exec_id = Uuid::now_v7();
        store
            .create_execution(crate::model::Execution::new(exec_id, "t", Value::Null))
            .await
            .unwrap();

        {
            let ctx = WorkflowContext::new(exec_id, store.clone(), vec![]);
            let _: u32 = ctx
                .step("x", || async { Ok::<_, anyhow::Error>(1) })
                .await
                .unwrap();
        }

        let preloaded = store.list_step_results(exec_id).await.unwrap();
        let ctx = WorkflowContext::new(exec_id, store.clone(), preloaded);
        let result = ctx.sleep("x", StdDuration::from_millis(10)).await;
        assert!(matches!(
            result,
            Err(WorkflowRunError::NonDeterminism { .. })
        ));
    }

    #[tokio::test]
    async fn sleep_zero_duration_never_suspends() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let exec_id = Uuid::now_v7();
        store
            .create_execution(crate::model::Execution::new(exec_id, "t", Value::Null))
            .await
            .unwrap();

        let ctx = WorkflowContext::new(exec_id, store.clone(), vec![]);
        ctx.sleep("s", StdDuration::ZERO)
            .await
            .expect("sleep(0) must resolve immediately, not suspend");

        let results = store.list_step_results(exec_id).await.unwrap();
        let sr = results.iter().find(|r| r.step_id == "s").unwrap();
        assert!(!sr.is_waiting());
        assert!(store.due_timers(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wait_for_signal_zero_timeout_resolves_to_timeout_immediately() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let exec_id = Uuid::now_v7();
        store
            .create_execution(crate::model::Execution::new(exec_id, "t", Value::Null))
            .await
            .unwrap();

        let signal = SignalDef::<Value>::new("never-arrives");
        let ctx = WorkflowContext::new(exec_id, store.clone(), vec![]);
        let outcome = ctx
            .wait_for_signal(
                &signal,
                WaitForSignalOptions {
                    step_id: "w".to_string(),
                    timeout_ms: Some(0),
                },
            )
            .await
            .expect("timeoutMs=0 must resolve, not suspend");
        assert!(matches!(outcome, SignalOutcome::Timeout));

        let results = store.list_step_results(exec_id).await.unwrap();
        let sr = results.iter().find(|r| r.step_id == "w").unwrap();
        assert!(!sr.is_waiting());
    }
}
