//! Worker Registry & Heartbeat Publisher (§4.6): makes a node's presence
//! and state visible to the admin surface in near-real-time via the KV
//! store's TTL keys and pub/sub channel.
//!
//! Grounded on the teacher's worker-presence pattern (register on start,
//! refresh on a ticker, deregister on graceful shutdown) adapted from a
//! single `worker:heartbeat` key to a per-worker-id key so multiple nodes
//! can be distinguished by the admin UI.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::kv::{KvError, KvStore};
use crate::model::{TelemetryEvent, WorkerRegistration};

pub const TELEMETRY_CHANNEL: &str = "platform_workers";
const REGISTRATION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reads and writes `worker:{worker_id}` presence records. A missing key
/// means offline (§4.6: "no explicit offline heartbeat is required for
/// crash cases").
pub struct WorkerRegistry {
    kv: Arc<dyn KvStore>,
}

impl WorkerRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(worker_id: &str) -> String {
        format!("worker:{worker_id}")
    }

    pub async fn register(&self, registration: &WorkerRegistration) -> Result<(), RegistryError> {
        let payload = serde_json::to_string(registration)?;
        self.kv
            .set(&Self::key(&registration.worker_id), &payload, Some(REGISTRATION_TTL))
            .await?;
        self.publish(TelemetryEvent::WorkerOnline {
            worker_id: registration.worker_id.clone(),
        })
        .await?;
        info!(worker_id = %registration.worker_id, "worker registered");
        Ok(())
    }

    pub async fn refresh(&self, worker_id: &str) -> Result<(), RegistryError> {
        self.kv.expire(&Self::key(worker_id), REGISTRATION_TTL).await?;
        Ok(())
    }

    pub async fn deregister(&self, worker_id: &str) -> Result<(), RegistryError> {
        self.kv.del(&Self::key(worker_id)).await?;
        self.publish(TelemetryEvent::WorkerOffline {
            worker_id: worker_id.to_string(),
        })
        .await?;
        info!(worker_id, "worker deregistered");
        Ok(())
    }

    pub async fn get(&self, worker_id: &str) -> Result<Option<WorkerRegistration>, RegistryError> {
        match self.kv.get(&Self::key(worker_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// All currently online worker registrations (§4.7: "list workers").
    pub async fn list(&self) -> Result<Vec<WorkerRegistration>, RegistryError> {
        let mut out = Vec::new();
        for key in self.kv.keys("worker:*").await? {
            if key.ends_with(":commands") {
                continue;
            }
            if let Some(raw) = self.kv.get(&key).await? {
                match serde_json::from_str(&raw) {
                    Ok(reg) => out.push(reg),
                    Err(err) => warn!(%key, %err, "dropping unparsable worker registration"),
                }
            }
        }
        Ok(out)
    }

    async fn publish(&self, event: TelemetryEvent) -> Result<(), RegistryError> {
        let payload = serde_json::to_string(&event)?;
        self.kv.publish(TELEMETRY_CHANNEL, &payload).await?;
        Ok(())
    }
}

/// Drives the presence side of the heartbeat (§4.6): register once, then on
/// every tick refresh the TTL. Snapshot publication itself is a separate
/// path — `WorkerProcess` emits `ProcessEvent::Heartbeat`, the Orchestrator
/// forwards it through [`crate::orchestrator::ResultSink::on_telemetry`] to
/// `BrokerConsumer::on_telemetry`, which publishes it to the telemetry
/// channel directly; this type only owns presence (TTL refresh +
/// online/offline events).
pub struct HeartbeatPublisher {
    registry: Arc<WorkerRegistry>,
    worker_id: String,
    interval: Duration,
}

impl HeartbeatPublisher {
    pub fn new(registry: Arc<WorkerRegistry>, worker_id: String, interval: Duration) -> Self {
        Self {
            registry,
            worker_id,
            interval,
        }
    }

    /// Registers the node and spawns the refresh loop. Returns a handle
    /// whose `shutdown` method performs the graceful-shutdown sequence
    /// from §4.6 ("delete the registration key; publish worker_offline").
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn start(self, hostname: String) -> Result<HeartbeatHandle, RegistryError> {
        let registration = WorkerRegistration {
            worker_id: self.worker_id.clone(),
            hostname,
            started_at: Utc::now(),
        };
        self.registry.register(&registration).await?;

        let registry = self.registry.clone();
        let worker_id = self.worker_id.clone();
        let interval = self.interval;
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = registry.refresh(&worker_id).await {
                            warn!(%worker_id, %err, "failed to refresh worker registration TTL");
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        Ok(HeartbeatHandle {
            registry: self.registry,
            worker_id: self.worker_id,
            stop_tx: Some(stop_tx),
        })
    }

}

pub struct HeartbeatHandle {
    registry: Arc<WorkerRegistry>,
    worker_id: String,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl HeartbeatHandle {
    /// Graceful shutdown sequence (§4.6): stop the refresh loop, delete
    /// the registration, publish `worker_offline`. The caller drains the
    /// Orchestrator afterward (outside this type's responsibility).
    pub async fn shutdown(mut self) -> Result<(), RegistryError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.registry.deregister(&self.worker_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    #[tokio::test]
    async fn register_then_list_then_deregister() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let registry = WorkerRegistry::new(kv);
        let reg = WorkerRegistration {
            worker_id: "node-1".to_string(),
            hostname: "host-a".to_string(),
            started_at: Utc::now(),
        };
        registry.register(&reg).await.unwrap();
        assert_eq!(registry.list().await.unwrap().len(), 1);

        registry.deregister("node-1").await.unwrap();
        assert!(registry.get("node-1").await.unwrap().is_none());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_loop_refreshes_and_shutdown_deregisters() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let registry = Arc::new(WorkerRegistry::new(kv));
        let publisher = HeartbeatPublisher::new(registry.clone(), "node-1".to_string(), Duration::from_millis(20));
        let handle = publisher.start("host-a".to_string()).await.unwrap();

        assert!(registry.get("node-1").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.get("node-1").await.unwrap().is_some());

        handle.shutdown().await.unwrap();
        assert!(registry.get("node-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn online_event_is_published() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let mut rx = kv.subscribe(TELEMETRY_CHANNEL).await.unwrap();
        let registry = WorkerRegistry::new(kv);
        registry
            .register(&WorkerRegistration {
                worker_id: "node-1".to_string(),
                hostname: "host-a".to_string(),
                started_at: Utc::now(),
            })
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("worker_online"));
    }
}
