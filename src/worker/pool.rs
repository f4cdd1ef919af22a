//! Worker (C4): claims executions and drives each through
//! [`Executor::advance`], translating the outcome into a Store transition
//! (spec §4.4).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::engine::{Executor, ExecutorError, Outcome, RetryAdvice};
use crate::model::{Execution, ExecutionStatus};
use crate::persistence::{ClaimedExecution, ExecutionPatch, Store};
use crate::signal::SignalBus;
use crate::worker::backpressure::{BackpressureConfig, BackpressureState};
use crate::worker::poller::{ExecutionPoller, PollerConfig};

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Identifies this worker to the Store (lease owner, observability).
    pub worker_id: String,

    /// Restrict claiming to executions of this task, if set.
    pub task_id: Option<String>,

    /// Maximum number of executions advanced concurrently by this pool.
    pub max_concurrency: usize,

    /// Lease TTL requested on claim; renewed at `ttl / 3` intervals.
    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,

    /// How long `shutdown()` waits for in-flight advances to finish before
    /// giving up and returning anyway.
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    pub poller: PollerConfig,
    pub backpressure: BackpressureConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_id: None,
            max_concurrency: 10,
            lease_ttl: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            poller: PollerConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool already started")]
    AlreadyStarted,

    #[error("store error: {0}")]
    Store(#[from] crate::persistence::StoreError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Claims executions and drives them to completion or suspension, one
/// `Executor::advance` call at a time per claim (spec §4.4).
///
/// Each claimed execution is handled on its own `tokio::spawn`ed task
/// ("fibre" per spec wording), gated by a `Semaphore` sized to
/// `max_concurrency`. A lease-renewal companion runs alongside each
/// advance and is cancelled the moment it returns.
pub struct WorkerPool {
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    signal_bus: Arc<SignalBus>,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    permits: Arc<Semaphore>,
    status: Arc<std::sync::RwLock<WorkerPoolStatus>>,
    in_flight: Arc<AtomicU32>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// `signal_bus` must be the same instance a co-located `Service` posts
    /// signals through, so this pool's poller wakes immediately on a post
    /// instead of waiting out its backoff (spec §4.5).
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<Executor>,
        signal_bus: Arc<SignalBus>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_concurrency,
        ));
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            store,
            executor,
            signal_bus,
            config,
            backpressure,
            permits,
            status: Arc::new(std::sync::RwLock::new(WorkerPoolStatus::Starting)),
            in_flight: Arc::new(AtomicU32::new(0)),
            shutdown_tx,
            shutdown_rx,
            poll_handle: std::sync::Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read().unwrap()
    }

    pub fn current_load(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed) as usize
    }

    pub fn is_accepting(&self) -> bool {
        self.backpressure.should_accept()
    }

    /// Starts the poll loop. Returns once the loop task is spawned, not
    /// once it finishes — call `shutdown()` to stop it.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write().unwrap();
            if *status != WorkerPoolStatus::Starting {
                return Err(WorkerPoolError::AlreadyStarted);
            }
            *status = WorkerPoolStatus::Running;
        }

        let handle = self.spawn_poll_loop();
        *self.poll_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Signals shutdown, waits (up to `shutdown_timeout`) for in-flight
    /// advances to drain, then joins the poll loop.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        *self.status.write().unwrap() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.in_flight.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.in_flight.load(Ordering::Relaxed) > 0 {
            warn!(
                in_flight = self.in_flight.load(Ordering::Relaxed),
                "shutdown timeout elapsed with executions still in flight"
            );
        }

        if let Some(handle) = self.poll_handle.lock().unwrap().take() {
            let _ = handle.await;
        }
        *self.status.write().unwrap() = WorkerPoolStatus::Stopped;
        Ok(())
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let executor = self.executor.clone();
        let signal_bus = self.signal_bus.clone();
        let config = self.config.clone();
        let backpressure = self.backpressure.clone();
        let permits = self.permits.clone();
        let in_flight = self.in_flight.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut poller = ExecutionPoller::new(
                store.clone(),
                config.worker_id.clone(),
                config.task_id.clone(),
                config.poller.clone(),
                shutdown_rx.clone(),
                signal_bus.subscribe_any(),
            );

            loop {
                if *shutdown_rx.borrow() {
                    debug!("poll loop stopping, shutdown requested");
                    return;
                }

                if !backpressure.should_accept() {
                    if poller.wait().await {
                        return;
                    }
                    continue;
                }

                let permit = match permits.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        if poller.wait().await {
                            return;
                        }
                        continue;
                    }
                };

                match poller.poll().await {
                    Ok(Some(claimed)) => {
                        backpressure.task_started();
                        in_flight.fetch_add(1, Ordering::Relaxed);
                        let store = store.clone();
                        let executor = executor.clone();
                        let lease_ttl = config.lease_ttl;
                        let backpressure = backpressure.clone();
                        let in_flight = in_flight.clone();
                        tokio::spawn(async move {
                            handle_claim(executor, store, claimed, lease_ttl).await;
                            backpressure.task_completed();
                            in_flight.fetch_sub(1, Ordering::Relaxed);
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        if poller.wait().await {
                            return;
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        error!(error = %e, "poll failed");
                        if poller.wait().await {
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Drives one claimed execution through `advance()` and applies the
/// resulting Store transition, per spec §4.4's 5-step loop contract.
async fn handle_claim(executor: Arc<Executor>, store: Arc<dyn Store>, claimed: ClaimedExecution, lease_ttl: Duration) {
    let ClaimedExecution { execution, lease_id } = claimed;
    let execution_id = execution.id;

    let cancel = Arc::new(Notify::new());
    let renewal = tokio::spawn(renew_lease_loop(
        store.clone(),
        execution_id,
        lease_id,
        lease_ttl,
        cancel.clone(),
    ));

    let outcome = executor.advance(&execution).await;

    cancel.notify_one();
    let _ = renewal.await;

    match outcome {
        Ok(outcome) => {
            if let Err(e) = apply_outcome(&store, &execution, outcome).await {
                error!(%execution_id, error = %e, "failed to apply advance outcome");
            }
        }
        Err(e) => {
            error!(%execution_id, error = %e, "advance failed");
        }
    }

    if let Err(e) = store.release_lease(execution_id, lease_id).await {
        warn!(%execution_id, error = %e, "failed to release lease");
    }
}

/// Calls `renew_lease` at `ttl / 3` intervals until `cancel` fires or a
/// renewal is refused (lease lost to another owner after expiry).
async fn renew_lease_loop(
    store: Arc<dyn Store>,
    execution_id: Uuid,
    lease_id: Uuid,
    ttl: Duration,
    cancel: Arc<Notify>,
) {
    let interval = (ttl / 3).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.notified() => return,
        }
        match store.renew_lease(execution_id, lease_id, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%execution_id, "lease renewal refused, lost to another owner");
                return;
            }
            Err(e) => {
                warn!(%execution_id, error = %e, "lease renewal errored");
                return;
            }
        }
    }
}

/// Translates an [`Outcome`] into the CAS call that moves `execution` out
/// of `Running`. A CAS failure means another worker already reclaimed the
/// execution after the lease expired; that's dropped silently per spec.
async fn apply_outcome(
    store: &Arc<dyn Store>,
    execution: &Execution,
    outcome: Outcome,
) -> Result<(), crate::persistence::StoreError> {
    let (to, patch) = match outcome {
        Outcome::Completed(value) => (
            ExecutionStatus::Completed,
            ExecutionPatch {
                result: Some(value),
                completed_at: Some(Utc::now()),
                clear_lease: true,
                ..Default::default()
            },
        ),
        Outcome::Suspended(crate::context::SuspendReason::Sleep { wake_at }) => (
            ExecutionStatus::Sleeping,
            ExecutionPatch {
                wake_at: Some(Some(wake_at)),
                clear_lease: true,
                ..Default::default()
            },
        ),
        Outcome::Suspended(crate::context::SuspendReason::Signal { signal_id, deadline }) => (
            ExecutionStatus::WaitingForSignal,
            ExecutionPatch {
                pending_signal_id: Some(Some(signal_id)),
                wake_at: Some(deadline),
                clear_lease: true,
                ..Default::default()
            },
        ),
        Outcome::Failed {
            error,
            advice: RetryAdvice::Retry { delay },
        } => (
            ExecutionStatus::Retrying,
            ExecutionPatch {
                error: Some(error),
                wake_at: Some(Some(Utc::now() + delay)),
                increment_attempt: true,
                clear_lease: true,
                ..Default::default()
            },
        ),
        Outcome::Failed {
            error,
            advice: RetryAdvice::GiveUp,
        } => (
            ExecutionStatus::Failed,
            ExecutionPatch {
                error: Some(error),
                completed_at: Some(Utc::now()),
                clear_lease: true,
                ..Default::default()
            },
        ),
        Outcome::Cancelled => (
            ExecutionStatus::Cancelled,
            ExecutionPatch {
                completed_at: Some(Utc::now()),
                clear_lease: true,
                ..Default::default()
            },
        ),
    };

    let applied = store
        .update_execution_status(execution.id, ExecutionStatus::Running, to, patch)
        .await?;
    if !applied {
        debug!(execution_id = %execution.id, "status CAS missed, execution already moved on");
    }
    Ok(())
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
