//! Service (C6): the external surface — `start`, `wait`, `startAndWait`,
//! `signal`, `describe`, and introspection (spec §4.6).
//!
//! Carries its `Store`, `SignalBus`, `ProcedureRegistry` and `Executor` by
//! reference rather than as process-wide statics, so multiple engines can
//! coexist in one process (spec §9 "Global mutable state").

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::context::StepOutline;
use crate::engine::{Executor, ExecutorError};
use crate::model::{
    Execution, ExecutionError, ExecutionFilter, ExecutionStatus, NoteEntry, Pagination, StepResult,
};
use crate::persistence::{Store, StoreError};
use crate::procedure::{ProcedureRegistry, RegistryError};
use crate::signal::SignalBus;

/// Options accepted by [`Service::wait`] / [`Service::start_and_wait`].
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Errors surfaced by the Service API (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Mirrors spec's `wait` contract: on `failed`, throws the persisted error.
    #[error("execution failed: {0}")]
    Failed(ExecutionError),

    /// On `cancelled`, `wait` throws cancellation.
    #[error("execution was cancelled")]
    Cancelled,

    /// Client-side deadline elapsed; does not terminate the execution
    /// (spec §7 `TimeoutError`).
    #[error("wait timed out")]
    Timeout,
}

/// The result of [`Service::start_and_wait`]: the value plus a pointer
/// back to the durable execution that produced it.
#[derive(Debug, Clone)]
pub struct StartAndWaitResult {
    pub data: Value,
    pub execution_id: Uuid,
}

/// Facade over `Store` + `SignalBus` + `ProcedureRegistry` + `Executor`.
/// Stateless itself — safe to share across tasks, and nothing here
/// prevents constructing several independent `Service`s in one process.
pub struct Service {
    store: Arc<dyn Store>,
    signal_bus: Arc<SignalBus>,
    registry: Arc<ProcedureRegistry>,
    executor: Arc<Executor>,
}

impl Service {
    pub fn new(
        store: Arc<dyn Store>,
        signal_bus: Arc<SignalBus>,
        registry: Arc<ProcedureRegistry>,
        executor: Arc<Executor>,
    ) -> Self {
        Self {
            store,
            signal_bus,
            registry,
            executor,
        }
    }

    /// Creates a new execution for `task_id` and returns its id. The
    /// Worker claims it on a later poll; `start` does not itself advance
    /// the execution.
    #[instrument(skip(self, input), fields(%task_id))]
    pub async fn start(&self, task_id: &str, input: Value) -> Result<Uuid, ServiceError> {
        if !self.registry.contains(task_id) {
            return Err(ServiceError::Registry(RegistryError::UnknownTaskId(
                task_id.to_string(),
            )));
        }
        let execution_id = Uuid::now_v7();
        self.store
            .create_execution(Execution::new(execution_id, task_id, input))
            .await?;
        Ok(execution_id)
    }

    /// Polls `loadExecution` until terminal, per spec §4.6.
    #[instrument(skip(self))]
    pub async fn wait(&self, execution_id: Uuid, opts: WaitOptions) -> Result<Value, ServiceError> {
        let deadline = tokio::time::Instant::now() + opts.timeout;
        loop {
            let execution = self.store.load_execution(execution_id).await?;
            match execution.status {
                ExecutionStatus::Completed => {
                    return Ok(execution.result.unwrap_or(Value::Null));
                }
                ExecutionStatus::Failed => {
                    return Err(ServiceError::Failed(
                        execution
                            .error
                            .unwrap_or_else(|| ExecutionError::new("execution failed with no recorded error")),
                    ));
                }
                ExecutionStatus::Cancelled => return Err(ServiceError::Cancelled),
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ServiceError::Timeout);
            }
            tokio::time::sleep(opts.poll_interval).await;
        }
    }

    /// `start` followed by `wait`, returning the value alongside the
    /// execution id so callers can inspect durable state afterward.
    #[instrument(skip(self, input), fields(%task_id))]
    pub async fn start_and_wait(
        &self,
        task_id: &str,
        input: Value,
        opts: WaitOptions,
    ) -> Result<StartAndWaitResult, ServiceError> {
        let execution_id = self.start(task_id, input).await?;
        let data = self.wait(execution_id, opts).await?;
        Ok(StartAndWaitResult { data, execution_id })
    }

    /// Shorthand for `SignalBus.post` filtered to one execution (spec
    /// §4.6). Returns `true` iff `execution_id` was among the waiters
    /// delivered to.
    #[instrument(skip(self, payload), fields(%signal_id))]
    pub async fn signal(
        &self,
        execution_id: Uuid,
        signal_id: &str,
        payload: Value,
    ) -> Result<bool, ServiceError> {
        let affected = self.signal_bus.post(signal_id, payload).await?;
        let delivered = affected.contains(&execution_id);
        if !delivered {
            warn!(%execution_id, %signal_id, "signal posted but did not reach the named execution");
        }
        Ok(delivered)
    }

    /// Writes `status = cancelled` iff `execution_id` is currently
    /// non-terminal (spec §4.4); a no-op returning `false` if the
    /// execution already reached a terminal status.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.store.cancel_execution(execution_id).await?)
    }

    /// Dry-run structural description of `task_id`'s declared steps (spec
    /// §4.6), run against `default_input` since branching may depend on
    /// input.
    #[instrument(skip(self, default_input), fields(%task_id))]
    pub async fn describe(&self, task_id: &str, default_input: Value) -> Result<StepOutline, ServiceError> {
        let outline = self
            .executor
            .describe(task_id, Uuid::now_v7(), default_input)
            .await?;
        Ok(outline)
    }

    pub async fn list_executions(
        &self,
        filter: ExecutionFilter,
        paging: Pagination,
    ) -> Result<Vec<Execution>, ServiceError> {
        Ok(self.store.list_executions(filter, paging).await?)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, ServiceError> {
        Ok(self.store.load_execution(execution_id).await?)
    }

    pub async fn list_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, ServiceError> {
        Ok(self.store.list_step_results(execution_id).await?)
    }

    pub async fn list_notes(&self, execution_id: Uuid) -> Result<Vec<NoteEntry>, ServiceError> {
        Ok(self.store.list_notes(execution_id).await?)
    }
}
