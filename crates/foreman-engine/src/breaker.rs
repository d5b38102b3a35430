//! Circuit Breaker & Blacklist (§4.5): quarantines workflows that
//! repeatedly go Stuck.
//!
//! Grounded on `DistributedCircuitBreaker`'s shared-state-via-store shape
//! (cache a read, mutate through the store, invalidate the cache) and
//! `CircuitBreakerConfig`'s plain-struct-of-thresholds style, adapted from
//! self-healing Closed/Open/HalfOpen to the one-way quarantine §4.5
//! describes: there is no HalfOpen here, and no automatic recovery — only
//! an explicit admin removal clears a workflow's stuck counter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::kv::{KvError, KvStore};
use crate::model::{BlacklistEntry, TelemetryEvent, WorkflowId};
use crate::store::{ExecutionStore, StoreError};

/// Channel the breaker publishes quarantine notifications on, for
/// whatever platform-admin notification consumer is listening (§7:
/// "Stuck and Blocked statuses additionally trigger platform-admin
/// notifications").
pub const ADMIN_NOTIFICATIONS_CHANNEL: &str = "platform_admin_notifications";

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts stuck events per workflow over a sliding window and, once the
/// threshold trips, writes a blacklist entry. Idempotent against
/// concurrent stuck events: re-checking `get_blacklist_entry` before
/// upserting means a second trip for the same workflow inside the same
/// tick is a no-op rather than a duplicate entry.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    kv: Arc<dyn KvStore>,
    store: Arc<dyn ExecutionStore>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, kv: Arc<dyn KvStore>, store: Arc<dyn ExecutionStore>) -> Self {
        Self { config, kv, store }
    }

    /// Records a stuck event for `workflow_id` and trips the breaker if
    /// the sliding-window count has reached the threshold.
    pub async fn record_stuck(&self, workflow_id: &WorkflowId) -> Result<(), CircuitBreakerError> {
        let now = Utc::now();
        let marker_key = format!("stuck:{workflow_id}:{}", now.timestamp_nanos_opt().unwrap_or(0));
        self.kv.set(&marker_key, "1", Some(self.config.window)).await?;

        let count = self.count_window(workflow_id).await?;
        if count < self.config.threshold as usize {
            return Ok(());
        }

        if self.store.get_blacklist_entry(workflow_id).await?.is_some() {
            // Already quarantined by a concurrent stuck event; idempotent.
            return Ok(());
        }

        let entry = BlacklistEntry::auto(workflow_id.clone(), count as u32, now);
        self.store.upsert_blacklist_entry(entry.clone()).await?;
        warn!(%workflow_id, stuck_count = count, "workflow auto-blacklisted");
        self.notify(&entry).await?;
        Ok(())
    }

    /// Count of live `stuck:{workflow_id}:*` keys, i.e. stuck events
    /// still inside the sliding window (expired keys have already been
    /// evicted by the KV store's TTL).
    async fn count_window(&self, workflow_id: &WorkflowId) -> Result<usize, CircuitBreakerError> {
        let pattern = format!("stuck:{workflow_id}:*");
        Ok(self.kv.keys(&pattern).await?.len())
    }

    /// Is the workflow currently blacklisted? Used by admission (§4.4).
    pub async fn is_blacklisted(&self, workflow_id: &WorkflowId) -> Result<bool, CircuitBreakerError> {
        Ok(self.store.get_blacklist_entry(workflow_id).await?.is_some())
    }

    /// Admin: blacklist a workflow manually.
    pub async fn blacklist_manual(
        &self,
        workflow_id: WorkflowId,
        note: String,
        by: String,
    ) -> Result<(), CircuitBreakerError> {
        let entry = BlacklistEntry::manual(workflow_id, note, by, Utc::now());
        self.store.upsert_blacklist_entry(entry.clone()).await?;
        self.notify(&entry).await?;
        Ok(())
    }

    /// Admin: remove a blacklist entry and clear the stuck counter so the
    /// workflow gets a fresh window (§4.5 manual operations).
    pub async fn remove(&self, workflow_id: &WorkflowId, removed_by: &str) -> Result<(), CircuitBreakerError> {
        self.store.mark_blacklist_removed(workflow_id, removed_by).await?;
        let pattern = format!("stuck:{workflow_id}:*");
        for key in self.kv.keys(&pattern).await? {
            self.kv.del(&key).await?;
        }
        Ok(())
    }

    async fn notify(&self, entry: &BlacklistEntry) -> Result<(), CircuitBreakerError> {
        let event = TelemetryEvent::ExecutionStuck {
            execution_id: uuid::Uuid::nil(),
            workflow_id: Some(entry.workflow_id.clone()),
        };
        let payload = serde_json::to_string(&event).unwrap_or_default();
        self.kv.publish(ADMIN_NOTIFICATIONS_CHANNEL, &payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use crate::store::InMemoryExecutionStore;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig {
                threshold,
                window: Duration::from_secs(3600),
            },
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryExecutionStore::new()),
        )
    }

    #[tokio::test]
    async fn trips_after_threshold_stuck_events() {
        let breaker = breaker(3);
        let wf = "wf-1".to_string();
        breaker.record_stuck(&wf).await.unwrap();
        assert!(!breaker.is_blacklisted(&wf).await.unwrap());
        breaker.record_stuck(&wf).await.unwrap();
        assert!(!breaker.is_blacklisted(&wf).await.unwrap());
        breaker.record_stuck(&wf).await.unwrap();
        assert!(breaker.is_blacklisted(&wf).await.unwrap());
    }

    #[tokio::test]
    async fn trip_is_idempotent_against_concurrent_events() {
        let breaker = breaker(1);
        let wf = "wf-1".to_string();
        breaker.record_stuck(&wf).await.unwrap();
        breaker.record_stuck(&wf).await.unwrap();
        // Second trip must not error and must not create a second entry;
        // InMemoryExecutionStore keeps a single map slot per workflow_id
        // so this mostly asserts the call path itself doesn't fail.
        assert!(breaker.is_blacklisted(&wf).await.unwrap());
    }

    #[tokio::test]
    async fn remove_clears_the_stuck_counter() {
        let breaker = breaker(2);
        let wf = "wf-1".to_string();
        breaker.record_stuck(&wf).await.unwrap();
        breaker.record_stuck(&wf).await.unwrap();
        assert!(breaker.is_blacklisted(&wf).await.unwrap());

        breaker.remove(&wf, "admin-1").await.unwrap();
        assert!(!breaker.is_blacklisted(&wf).await.unwrap());
        assert_eq!(breaker.count_window(&wf).await.unwrap(), 0);
    }
}
