//! Execution polling with adaptive backoff.
//!
//! Adapted from the teacher's activity-task poller: claiming now pulls a
//! single durable [`crate::model::Execution`] via [`Store::claim`] instead
//! of a batch of typed activity tasks, since claim's 4-tier priority
//! ordering (spec §4.3) already picks the single best candidate.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, instrument, trace};

use crate::persistence::{ClaimOptions, ClaimedExecution, Store, StoreError};

/// Polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when work is available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no execution is claimable
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Claims at most one execution per poll, backing off adaptively when
/// idle and resetting to the minimum interval as soon as it finds work.
pub struct ExecutionPoller {
    store: Arc<dyn Store>,
    owner: String,
    task_id: Option<String>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
    wake: Arc<Notify>,
}

impl ExecutionPoller {
    pub fn new(
        store: Arc<dyn Store>,
        owner: String,
        task_id: Option<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            owner,
            task_id,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
            wake,
        }
    }

    /// Attempts to claim a single execution; updates the internal backoff
    /// state depending on whether anything was claimable.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn poll(&mut self) -> Result<Option<ClaimedExecution>, PollerError> {
        if *self.shutdown_rx.borrow() {
            debug!("poller shutdown requested");
            return Ok(None);
        }

        let claimed = self
            .store
            .claim(
                &self.owner,
                ClaimOptions {
                    task_id: self.task_id.clone(),
                },
            )
            .await
            .map_err(PollerError::Store)?;

        match &claimed {
            Some(c) => {
                self.reset_backoff();
                debug!(execution_id = %c.execution.id, "claimed execution");
            }
            None => {
                self.increase_backoff();
                trace!(interval_ms = self.current_interval.as_millis(), "nothing claimable");
            }
        }

        Ok(claimed)
    }

    /// Waits out the current backoff interval, or returns early (`true`)
    /// if shutdown is signaled first. Also wakes early, without waiting
    /// out the rest of the backoff, on a `SignalBus` post (spec §4.5) —
    /// and resets backoff to the minimum interval, since a signal means
    /// there is very likely work to claim now.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let wake = self.wake.clone();
        let woken = tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = wake.notified() => {
                trace!("woken by signal post before backoff elapsed");
                true
            }
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                return true;
            }
        };
        if woken {
            self.reset_backoff();
        }
        false
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker is shutting down")]
    Shutdown,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Execution;
    use crate::persistence::InMemoryStore;
    use serde_json::Value;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(5));
        assert_eq!(config.backoff_multiplier, 1.5);
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 2.0);
    }

    #[tokio::test]
    async fn poll_claims_pending_execution_and_resets_backoff() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let (_tx, rx) = watch::channel(false);
        let mut poller = ExecutionPoller::new(
            store.clone(),
            "worker-1".into(),
            None,
            PollerConfig::default(),
            rx,
            Arc::new(Notify::new()),
        );

        assert!(poller.poll().await.unwrap().is_none());
        assert!(poller.current_interval() > PollerConfig::default().min_interval);

        let exec_id = uuid::Uuid::now_v7();
        store
            .create_execution(Execution::new(exec_id, "t", Value::Null))
            .await
            .unwrap();

        let claimed = poller.poll().await.unwrap();
        assert_eq!(claimed.unwrap().execution.id, exec_id);
        assert_eq!(poller.current_interval(), PollerConfig::default().min_interval);
    }
}
