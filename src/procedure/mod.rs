//! Registry of user-supplied durable procedures, indexed by `taskId`.
//!
//! Generalizes the teacher's type-erased `AnyWorkflow`/`WorkflowFactory`/
//! `WorkflowRegistry` trio (`engine::registry`) from a callback-driven
//! state machine to a single replay-invoked async procedure: `run` is
//! called from the top on every attempt, and [`crate::context::WorkflowContext`]
//! handles short-circuiting already-journaled work.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::{WorkflowContext, WorkflowRunError};
use crate::reliability::RetryPolicy;

/// A durable procedure definition. `TASK_ID` must be stable across
/// restarts — it is the lookup key on replay (spec §6).
#[async_trait]
pub trait WorkflowProcedure: Send + Sync + 'static {
    const TASK_ID: &'static str;
    type Input: Serialize + DeserializeOwned + Send + Sync;
    type Output: Serialize + DeserializeOwned + Send + Sync;

    async fn run(
        &self,
        ctx: WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowRunError>;

    /// Retry policy consulted when `run` returns a non-suspend error
    /// (spec §4.2). Defaults to giving up on the first error.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// Type-erased interface the Executor invokes without knowing a
/// procedure's concrete input/output types.
#[async_trait]
pub trait AnyProcedure: Send + Sync {
    fn task_id(&self) -> &'static str;

    fn retry_policy(&self) -> RetryPolicy;

    async fn run_json(
        &self,
        ctx: WorkflowContext,
        input: Value,
    ) -> Result<Value, WorkflowRunError>;
}

struct ProcedureWrapper<P: WorkflowProcedure> {
    inner: P,
}

#[async_trait]
impl<P: WorkflowProcedure> AnyProcedure for ProcedureWrapper<P> {
    fn task_id(&self) -> &'static str {
        P::TASK_ID
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }

    async fn run_json(
        &self,
        ctx: WorkflowContext,
        input: Value,
    ) -> Result<Value, WorkflowRunError> {
        let typed_input: P::Input = serde_json::from_value(input).map_err(|e| {
            WorkflowRunError::Failed(anyhow::anyhow!("failed to decode procedure input: {e}"))
        })?;
        let output = self.inner.run(ctx, typed_input).await?;
        serde_json::to_value(output).map_err(|e| {
            WorkflowRunError::Failed(anyhow::anyhow!("failed to encode procedure output: {e}"))
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown task id: {0}")]
    UnknownTaskId(String),
}

/// Maps `taskId` to registered procedures.
#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<String, Arc<dyn AnyProcedure>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: WorkflowProcedure>(&mut self, procedure: P) {
        self.procedures.insert(
            P::TASK_ID.to_string(),
            Arc::new(ProcedureWrapper { inner: procedure }),
        );
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.procedures.contains_key(task_id)
    }

    pub fn get(&self, task_id: &str) -> Result<Arc<dyn AnyProcedure>, RegistryError> {
        self.procedures
            .get(task_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTaskId(task_id.to_string()))
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("task_ids", &self.procedures.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Input {
        value: i32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Output {
        doubled: i32,
    }

    struct Doubler;

    #[async_trait]
    impl WorkflowProcedure for Doubler {
        const TASK_ID: &'static str = "doubler";
        type Input = Input;
        type Output = Output;

        async fn run(
            &self,
            _ctx: WorkflowContext,
            input: Self::Input,
        ) -> Result<Self::Output, WorkflowRunError> {
            Ok(Output {
                doubled: input.value * 2,
            })
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = ProcedureRegistry::new();
        registry.register(Doubler);

        assert!(registry.contains("doubler"));
        assert!(!registry.contains("unknown"));
        assert!(registry.get("unknown").is_err());
        assert!(registry.get("doubler").is_ok());
    }
}
