//! Admin Control Surface (§4.7): the narrow set of operations the HTTP
//! layer exposes to platform admins. Thin queries/commands over the data
//! already described elsewhere; authorization is the external layer's
//! problem.
//!
//! `recycle_process` is cross-node: it publishes a command on
//! `worker:{worker_id}:commands` rather than calling an in-process
//! `Orchestrator` directly, since the admin surface may run on a
//! different node than the one hosting the target worker.
//! `spawn_command_listener` is the other half, run on every node that
//! owns an `Orchestrator`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerError};
use crate::consumer::{BrokerConsumer, PendingExecutionSummary};
use crate::kv::{KvError, KvStore};
use crate::model::{BlacklistEntry, StuckHistoryEntry, WorkerRegistration, WorkflowId};
use crate::orchestrator::Orchestrator;
use crate::registry::{RegistryError, WorkerRegistry};
use crate::store::{ExecutionStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Breaker(#[from] CircuitBreakerError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum AdminCommand {
    RecycleProcess {
        pid: u32,
        reason: String,
        requested_by: Option<String>,
    },
    Shutdown,
}

/// Every operation §4.7 lists, over the engine components that already
/// implement the underlying behaviour.
pub struct AdminOps {
    store: Arc<dyn ExecutionStore>,
    kv: Arc<dyn KvStore>,
    registry: Arc<WorkerRegistry>,
    breaker: Arc<CircuitBreaker>,
    consumer: Arc<BrokerConsumer>,
}

impl AdminOps {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        kv: Arc<dyn KvStore>,
        registry: Arc<WorkerRegistry>,
        breaker: Arc<CircuitBreaker>,
        consumer: Arc<BrokerConsumer>,
    ) -> Self {
        Self {
            store,
            kv,
            registry,
            breaker,
            consumer,
        }
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRegistration>, AdminError> {
        Ok(self.registry.list().await?)
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRegistration>, AdminError> {
        Ok(self.registry.get(worker_id).await?)
    }

    /// Publishes a recycle command for the Orchestrator on `worker_id`'s
    /// node to pick up (§4.7).
    pub async fn recycle_process(
        &self,
        worker_id: &str,
        pid: u32,
        reason: String,
        requested_by: Option<String>,
    ) -> Result<(), AdminError> {
        let command = AdminCommand::RecycleProcess {
            pid,
            reason,
            requested_by,
        };
        let payload = serde_json::to_string(&command)?;
        self.kv.publish(&format!("worker:{worker_id}:commands"), &payload).await?;
        Ok(())
    }

    pub fn list_queue(&self, limit: usize) -> Vec<PendingExecutionSummary> {
        self.consumer.list_pending(limit)
    }

    pub async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, AdminError> {
        Ok(self.store.list_blacklist().await?)
    }

    pub async fn add_blacklist(
        &self,
        workflow_id: WorkflowId,
        note: String,
        by: String,
    ) -> Result<(), AdminError> {
        self.breaker.blacklist_manual(workflow_id, note, by).await?;
        Ok(())
    }

    pub async fn remove_blacklist(&self, workflow_id: &WorkflowId, removed_by: &str) -> Result<(), AdminError> {
        self.breaker.remove(workflow_id, removed_by).await?;
        Ok(())
    }

    pub async fn stuck_history(&self, since: DateTime<Utc>) -> Result<Vec<StuckHistoryEntry>, AdminError> {
        Ok(self.store.stuck_history_aggregate(since).await?)
    }
}

/// Runs on every node that owns an `Orchestrator`: subscribes to
/// `worker:{worker_id}:commands` and translates admin commands into
/// direct calls on the local `Orchestrator` (§4.7, §6's command table).
pub fn spawn_command_listener(kv: Arc<dyn KvStore>, worker_id: String, orchestrator: Orchestrator) {
    tokio::spawn(async move {
        let channel = format!("worker:{worker_id}:commands");
        let mut rx = match kv.subscribe(&channel).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(%channel, %err, "failed to subscribe to admin command channel");
                return;
            }
        };
        while let Ok(raw) = rx.recv().await {
            match serde_json::from_str::<AdminCommand>(&raw) {
                Ok(AdminCommand::RecycleProcess { pid, reason, requested_by }) => {
                    info!(pid, %reason, ?requested_by, "handling recycle_process admin command");
                    if let Err(err) = orchestrator.recycle_process(pid, reason).await {
                        warn!(pid, %err, "failed to recycle process");
                    }
                }
                Ok(AdminCommand::Shutdown) => {
                    info!("handling shutdown admin command");
                    if let Err(err) = orchestrator.stop().await {
                        warn!(%err, "graceful shutdown via admin command did not complete in time");
                    }
                }
                Err(err) => warn!(%raw, %err, "dropping unparsable admin command"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::consumer::{Broker, NoopPrewarm};
    use crate::kv::InMemoryKvStore;
    use crate::model::ExecutionId;
    use crate::store::InMemoryExecutionStore;
    use async_trait::async_trait;

    struct NoopBroker;
    #[async_trait]
    impl Broker for NoopBroker {
        async fn ack(&self, _execution_id: ExecutionId) {}
        async fn nack(&self, _execution_id: ExecutionId) {}
    }

    fn admin_ops() -> AdminOps {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let registry = Arc::new(WorkerRegistry::new(kv.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            kv.clone(),
            store.clone(),
        ));
        let consumer = Arc::new(BrokerConsumer::new(
            store.clone(),
            kv.clone(),
            breaker.clone(),
            Arc::new(NoopBroker),
            Arc::new(NoopPrewarm),
        ));
        AdminOps::new(store, kv, registry, breaker, consumer)
    }

    #[tokio::test]
    async fn blacklist_add_then_list_then_remove() {
        let ops = admin_ops();
        ops.add_blacklist("wf-1".to_string(), "bad actor".to_string(), "admin-1".to_string())
            .await
            .unwrap();
        let active = ops.list_blacklist().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].workflow_id, "wf-1");

        ops.remove_blacklist(&"wf-1".to_string(), "admin-1").await.unwrap();
        assert!(ops.list_blacklist().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recycle_process_publishes_a_command() {
        let ops = admin_ops();
        let mut rx = ops.kv.subscribe("worker:node-1:commands").await.unwrap();
        ops.recycle_process("node-1", 7, "manual".to_string(), Some("admin-1".to_string()))
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("recycle_process"));
        assert!(msg.contains('7'));
    }

    #[tokio::test]
    async fn empty_queue_reports_no_pending_executions() {
        let ops = admin_ops();
        assert!(ops.list_queue(10).is_empty());
    }
}
