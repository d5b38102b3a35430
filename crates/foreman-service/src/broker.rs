//! In-process stand-in for the message broker (SPEC_FULL.md §1: the real
//! broker is an external collaborator, specified only by its interface —
//! the engine only defines how it consumes and acks). This adapter is
//! what local runs and the bundled enqueue route submit work through;
//! a production deployment swaps it for a client of whatever real queue
//! the broker sits behind, implementing the same `Broker` trait.
//!
//! Grounded on `TaskPoller`'s poll-loop shape (own the receive side,
//! forward each item to the consumer, keep polling until shutdown),
//! adapted from a claim-from-store poll to a push-based channel receive
//! since there is no store to claim against here.

use std::sync::Arc;

use async_trait::async_trait;
use foreman_engine::consumer::{Broker, BrokerConsumer};
use foreman_engine::model::{ExecutionId, ExecutionRequest};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, instrument, warn};

/// Bounded so a stalled Consumer applies backpressure to submitters
/// instead of growing memory without limit.
const QUEUE_CAPACITY: usize = 1024;

pub struct InProcessBroker {
    tx: mpsc::Sender<ExecutionRequest>,
    rx: Mutex<Option<mpsc::Receiver<ExecutionRequest>>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Enqueues a request for delivery to the Consumer. Mirrors a real
    /// broker's publish call.
    pub async fn submit(&self, req: ExecutionRequest) -> Result<(), SubmitError> {
        self.tx.send(req).await.map_err(|_| SubmitError::Closed)
    }

    /// Runs the receive loop until the channel closes. Takes the receiver
    /// exactly once; a second call is a programmer error since there is
    /// only ever one consumer loop per process.
    #[instrument(skip(self, consumer))]
    pub async fn run(&self, consumer: Arc<BrokerConsumer>) {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .expect("InProcessBroker::run must only be called once");

        info!("broker consume loop started");
        while let Some(req) = rx.recv().await {
            let execution_id = req.execution_id;
            if let Err(err) = consumer.handle_message(req).await {
                warn!(%execution_id, %err, "consumer failed to handle message");
            }
        }
        info!("broker consume loop stopped: channel closed");
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("broker queue is closed")]
    Closed,
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn ack(&self, execution_id: ExecutionId) {
        info!(%execution_id, "ack");
    }

    async fn nack(&self, execution_id: ExecutionId) {
        warn!(%execution_id, "nack");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::EngineConfig;
    use foreman_engine::breaker::{CircuitBreaker, CircuitBreakerConfig};
    use foreman_engine::consumer::NoopPrewarm;
    use foreman_engine::kv::{InMemoryKvStore, KvStore};
    use foreman_engine::orchestrator::Orchestrator;
    use foreman_engine::runner::{ExecutionContext, Runner, Sandbox, SandboxOutcome};
    use foreman_engine::store::{ExecutionStore, InMemoryExecutionStore};
    use std::time::Duration;
    use uuid::Uuid;

    struct ImmediateSandbox;

    #[async_trait]
    impl Sandbox for ImmediateSandbox {
        async fn execute(&self, _ctx: &ExecutionContext) -> SandboxOutcome {
            SandboxOutcome::Success(serde_json::json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn submitted_request_is_handled_and_acked() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default(), kv.clone(), store.clone()));
        let broker = Arc::new(InProcessBroker::new());
        let consumer = Arc::new(BrokerConsumer::new(
            store,
            kv,
            breaker,
            broker.clone(),
            Arc::new(NoopPrewarm),
        ));
        let runner = Arc::new(Runner::new(Arc::new(ImmediateSandbox)));
        let config = EngineConfig {
            min_workers: 1,
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let orchestrator = Orchestrator::start(config, runner, consumer.clone()).await;
        consumer.attach_orchestrator(orchestrator);

        let consume_task = tokio::spawn({
            let broker = broker.clone();
            let consumer = consumer.clone();
            async move { broker.run(consumer).await }
        });

        let req = ExecutionRequest {
            execution_id: Uuid::now_v7(),
            workflow_id: None,
            organization_id: None,
            caller_org_id: None,
            code_ref: "inline".to_string(),
            params: serde_json::json!({}),
            timeout_seconds: 5,
            is_script: true,
            enqueued_at: chrono::Utc::now(),
        };
        broker.submit(req).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(broker);
        let _ = tokio::time::timeout(Duration::from_millis(200), consume_task).await;
    }
}
