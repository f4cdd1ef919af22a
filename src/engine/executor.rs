//! Executor (C2): drives a single `advance()` call per Worker loop
//! iteration by re-invoking the user procedure from the top and letting
//! [`WorkflowContext`] short-circuit already-journaled work (spec §4.2).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::context::{StepOutline, SuspendReason, WorkflowContext, WorkflowRunError};
use crate::model::{Execution, ExecutionError, ExecutionStatus};
use crate::persistence::Store;
use crate::procedure::{ProcedureRegistry, RegistryError};

/// Safety valve against a procedure that never terminates and never
/// suspends (spec §4.2 "edge cases").
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_step_count: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_step_count: 10_000,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_step_count(mut self, max_step_count: usize) -> Self {
        self.max_step_count = max_step_count;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] crate::persistence::StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// What the retry policy recommends after a non-suspend failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAdvice {
    Retry { delay: Duration },
    GiveUp,
}

/// Result of one `advance()` call (spec §4.2).
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(Value),
    Suspended(SuspendReason),
    Failed {
        error: ExecutionError,
        advice: RetryAdvice,
    },
    Cancelled,
}

/// Drives `advance()`. Stateless apart from its registry/store handles —
/// safe to share across Worker tasks.
pub struct Executor {
    store: Arc<dyn Store>,
    registry: Arc<ProcedureRegistry>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ProcedureRegistry>) -> Self {
        Self {
            store,
            registry,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Re-invokes the procedure registered under `execution.task_id` from
    /// the top, bound to a [`WorkflowContext`] preloaded with this
    /// execution's journal.
    #[instrument(skip(self, execution), fields(execution_id = %execution.id, task_id = %execution.task_id, attempt = execution.attempt))]
    pub async fn advance(&self, execution: &Execution) -> Result<Outcome, ExecutorError> {
        if execution.status == ExecutionStatus::Cancelled {
            return Ok(Outcome::Cancelled);
        }

        let procedure = self.registry.get(&execution.task_id)?;
        let step_results = self.store.list_step_results(execution.id).await?;
        if step_results.len() > self.config.max_step_count {
            warn!(
                step_count = step_results.len(),
                max = self.config.max_step_count,
                "execution exceeded max step count"
            );
            return Ok(Outcome::Failed {
                error: ExecutionError::new(format!(
                    "exceeded max step count ({})",
                    self.config.max_step_count
                )),
                advice: RetryAdvice::GiveUp,
            });
        }

        let ctx = WorkflowContext::new(execution.id, self.store.clone(), step_results);
        match procedure.run_json(ctx, execution.input.clone()).await {
            Ok(value) => {
                debug!("execution completed");
                Ok(Outcome::Completed(value))
            }
            Err(WorkflowRunError::Suspended(reason)) => {
                debug!("execution suspended");
                Ok(Outcome::Suspended(reason))
            }
            Err(WorkflowRunError::Store(e)) => Err(ExecutorError::Store(e)),
            Err(WorkflowRunError::NonDeterminism {
                step_id,
                journaled,
                current,
            }) => {
                warn!(%step_id, ?journaled, ?current, "non-determinism detected");
                Ok(Outcome::Failed {
                    error: ExecutionError::new(format!(
                        "non-determinism detected at step {step_id}: journaled {journaled:?}, current call {current:?}"
                    )),
                    advice: RetryAdvice::GiveUp,
                })
            }
            Err(WorkflowRunError::DuplicateStepId(step_id)) => Ok(Outcome::Failed {
                error: ExecutionError::new(format!("duplicate step id {step_id}")),
                advice: RetryAdvice::GiveUp,
            }),
            Err(WorkflowRunError::Failed(err)) => {
                let policy = procedure.retry_policy();
                let next_attempt = execution.attempt + 1;
                let advice = if policy.has_attempts_remaining(next_attempt) && policy.should_retry(None) {
                    RetryAdvice::Retry {
                        delay: policy.delay_for_attempt(next_attempt),
                    }
                } else {
                    RetryAdvice::GiveUp
                };
                warn!(error = %err, ?advice, "procedure step failed");
                Ok(Outcome::Failed {
                    error: ExecutionError::with_stack(err.to_string(), format!("{err:?}")),
                    advice,
                })
            }
        }
    }

    /// Dry-run: explores the default-input-path through the procedure
    /// without executing step bodies or side effects, for
    /// `Service::describe` (spec §4.6).
    #[instrument(skip(self, input), fields(%task_id))]
    pub async fn describe(
        &self,
        task_id: &str,
        execution_id: uuid::Uuid,
        input: Value,
    ) -> Result<StepOutline, ExecutorError> {
        let procedure = self.registry.get(task_id)?;
        let outline = Arc::new(parking_lot::RwLock::new(StepOutline::default()));
        let ctx = WorkflowContext::describe(execution_id, self.store.clone(), outline.clone());
        // describe mode never executes step bodies, so `run_json` always
        // returns early via WorkflowRunError::Failed; the outline it built
        // along the way is what callers want.
        let _ = procedure.run_json(ctx, input).await;
        Ok(Arc::try_unwrap(outline)
            .map(|lock| lock.into_inner())
            .unwrap_or_else(|arc| arc.read().clone()))
    }
}
