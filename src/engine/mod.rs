//! Execution engine (C2): drives `advance()` — re-invoking a registered
//! procedure from the top and letting [`crate::context::WorkflowContext`]
//! short-circuit work already recorded in the journal.

mod executor;

pub use executor::{Executor, ExecutorConfig, ExecutorError, Outcome, RetryAdvice};
