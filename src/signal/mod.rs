//! SignalBus (C5): bridges an externally-posted signal to the executions
//! currently waiting on it (spec §4.5).
//!
//! Grounded on the teacher's `WorkflowSignal` envelope shape
//! (`workflow/signal.rs`), generalized from a callback-delivered
//! cancel/shutdown/custom enum to an opaque named-payload post that the
//! Store durably routes to `SignalWaiter` rows.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::persistence::{Store, StoreError};

/// A signal envelope, kept for callers that want to construct or log one
/// without reaching into `serde_json::Value` directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub signal_id: String,
    pub payload: Value,
    pub posted_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(signal_id: impl Into<String>, payload: Value) -> Self {
        Self {
            signal_id: signal_id.into(),
            payload,
            posted_at: Utc::now(),
        }
    }
}

/// Routes posted signals to waiting executions and wakes local workers
/// immediately, without waiting for their next poll interval.
///
/// One `SignalBus` is shared by every `Worker` in a process; the
/// in-process `Notify` handles are per-execution so a post only wakes the
/// workers actually blocked on that execution's poll backoff.
/// `wake_any` is a second, coarser handle: every poller in a co-located
/// `WorkerPool` subscribes to it so a post can pull a poller out of its
/// backoff immediately even before it knows which execution to look for
/// (spec §4.5).
pub struct SignalBus {
    store: Arc<dyn Store>,
    wake: RwLock<HashMap<Uuid, Arc<Notify>>>,
    wake_any: Arc<Notify>,
}

impl SignalBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            wake: RwLock::new(HashMap::new()),
            wake_any: Arc::new(Notify::new()),
        }
    }

    /// Registers (or fetches) the `Notify` handle a worker can await to be
    /// woken as soon as a signal affecting `execution_id` is posted,
    /// instead of waiting out its poll interval.
    pub fn subscribe(&self, execution_id: Uuid) -> Arc<Notify> {
        self.wake
            .write()
            .entry(execution_id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// The shared handle a poll loop selects on to wake immediately on
    /// any post, regardless of which execution it targets.
    pub fn subscribe_any(&self) -> Arc<Notify> {
        self.wake_any.clone()
    }

    /// `post(signalId, payload)`: atomically marks every waiting execution
    /// ready via the Store, then wakes any locally-subscribed workers.
    /// Signals with no waiters are dropped — not buffered for late
    /// subscribers (spec §4.5).
    #[instrument(skip(self, payload), fields(%signal_id))]
    pub async fn post(&self, signal_id: &str, payload: Value) -> Result<Vec<Uuid>, StoreError> {
        let affected = self.store.signal_ready(signal_id, payload).await?;
        debug!(delivered = affected.len(), "signal posted");
        let wake = self.wake.read();
        for execution_id in &affected {
            if let Some(notify) = wake.get(execution_id) {
                notify.notify_waiters();
            }
        }
        drop(wake);
        if !affected.is_empty() {
            self.wake_any.notify_waiters();
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Execution, SignalWaiter};
    use crate::persistence::{InMemoryStore, StepResultWrite};

    #[tokio::test]
    async fn post_delivers_to_waiter_and_wakes_subscriber() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let bus = SignalBus::new(store.clone());

        let exec_id = Uuid::now_v7();
        store
            .create_execution(Execution::new(exec_id, "t", Value::Null))
            .await
            .unwrap();
        store
            .append_step_result(StepResultWrite::signal_wait_waiting(
                exec_id,
                "wait-1",
                SignalWaiter {
                    signal_id: "order.approved".into(),
                    execution_id: exec_id,
                    step_id: "wait-1".into(),
                    created_at: Utc::now(),
                    deadline: None,
                },
                None,
            ))
            .await
            .unwrap();

        let notify = bus.subscribe(exec_id);
        let waiter_task = tokio::spawn({
            let notify = notify.clone();
            async move {
                tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
                    .await
                    .expect("should be woken by post()");
            }
        });

        let affected = bus
            .post("order.approved", serde_json::json!({"orderId": 42}))
            .await
            .unwrap();
        assert_eq!(affected, vec![exec_id]);
        waiter_task.await.unwrap();
    }

    #[tokio::test]
    async fn post_with_no_waiters_is_a_noop() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let bus = SignalBus::new(store);
        let affected = bus.post("nobody.listening", Value::Null).await.unwrap();
        assert!(affected.is_empty());
    }
}
