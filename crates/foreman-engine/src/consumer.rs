//! Broker Consumer (§4.4): translates broker messages into engine calls,
//! enforces admission (blacklist), and finalizes outcomes back to the
//! store and telemetry channel.
//!
//! Grounded on `TaskPoller`'s backoff-then-reset shape for the retry
//! timing and `RetryPolicy::exponential`'s config-struct style for the
//! finalize-write retry policy, both adapted from per-activity retry to
//! a single bounded retry-then-surrender loop around one store write
//! (§4.4: "retries with bounded exponential backoff before surrendering").

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::kv::KvStore;
use crate::model::{
    ErrorType, ExecutionId, ExecutionRequest, ExecutionResultRecord, ResultMessage,
    TelemetryEvent, TerminalStatus, WorkflowId,
};
use crate::orchestrator::{Orchestrator, OrchestratorError, ResultSink};
use crate::runner::{prepare_context, CancellationHandle};
use crate::store::{ExecutionStore, StoreError};

pub const TELEMETRY_CHANNEL: &str = "platform_workers";

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Breaker(#[from] crate::breaker::CircuitBreakerError),
}

/// Best-effort cache warmer run before routing (§4.4: "if prewarm fails,
/// log a structured warning but proceed"). The real implementations
/// (secrets, config, SDK metadata) are external collaborators.
#[async_trait]
pub trait PrewarmHook: Send + Sync {
    async fn prewarm(&self, req: &ExecutionRequest) -> Result<(), String>;
}

pub struct NoopPrewarm;

#[async_trait]
impl PrewarmHook for NoopPrewarm {
    async fn prewarm(&self, _req: &ExecutionRequest) -> Result<(), String> {
        Ok(())
    }
}

/// The broker interface the Consumer acks/nacks against. Out of scope
/// per §1 ("the message broker used for dispatch"); modeled here only by
/// its interface.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn ack(&self, execution_id: ExecutionId);
    async fn nack(&self, execution_id: ExecutionId);
}

/// Bounded exponential backoff for the terminal-record write, grounded
/// on the teacher's `RetryPolicy::exponential` defaults.
#[derive(Debug, Clone)]
struct RetryPolicy {
    max_attempts: u32,
    initial_interval: Duration,
    max_interval: Duration,
    backoff_coefficient: f64,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(attempt as i32);
        let capped = base.min(self.max_interval.as_secs_f64());
        let jitter_span = capped * self.jitter;
        let jittered = capped + rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

struct PendingExecution {
    workflow_id: Option<WorkflowId>,
    started_at: chrono::DateTime<Utc>,
}

/// The Broker Consumer: admission, prewarm, routing, and finalization.
pub struct BrokerConsumer {
    store: Arc<dyn ExecutionStore>,
    kv: Arc<dyn KvStore>,
    breaker: Arc<CircuitBreaker>,
    // `Orchestrator::start` needs a `ResultSink`, and this Consumer is
    // that sink, so the Orchestrator can't be a constructor argument here
    // without a cycle. Callers build the Consumer first, then the
    // Orchestrator (passing the Consumer in as the sink), then attach it.
    orchestrator: OnceLock<Orchestrator>,
    broker: Arc<dyn Broker>,
    prewarm: Arc<dyn PrewarmHook>,
    retry: RetryPolicy,
    pending: DashMap<ExecutionId, PendingExecution>,
}

impl BrokerConsumer {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        kv: Arc<dyn KvStore>,
        breaker: Arc<CircuitBreaker>,
        broker: Arc<dyn Broker>,
        prewarm: Arc<dyn PrewarmHook>,
    ) -> Self {
        Self {
            store,
            kv,
            breaker,
            orchestrator: OnceLock::new(),
            broker,
            prewarm,
            retry: RetryPolicy::default(),
            pending: DashMap::new(),
        }
    }

    /// Wires the Orchestrator in once both sides exist. Must be called
    /// before [`Self::handle_message`] is ever invoked.
    pub fn attach_orchestrator(&self, orchestrator: Orchestrator) {
        let _ = self.orchestrator.set(orchestrator);
    }

    fn orchestrator(&self) -> &Orchestrator {
        self.orchestrator
            .get()
            .expect("BrokerConsumer::attach_orchestrator must run before handle_message")
    }

    /// Handles one inbound broker message end to end up through dispatch.
    /// The terminal record and broker ack/nack happen later, in
    /// [`Self::on_result`], once the execution actually finishes.
    pub async fn handle_message(&self, req: ExecutionRequest) -> Result<(), ConsumerError> {
        if let Err(err) = req.validate() {
            warn!(execution_id = %req.execution_id, %err, "rejecting invalid execution request");
            self.write_terminal_and_settle(ExecutionResultRecord {
                execution_id: req.execution_id,
                workflow_id: req.workflow_id.clone(),
                status: TerminalStatus::Failed,
                result_payload: None,
                error_type: Some(ErrorType::UserError),
                error_message: Some(err.to_string()),
                duration_ms: 0,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            })
            .await;
            return Ok(());
        }

        if !req.is_script {
            if let Some(workflow_id) = &req.workflow_id {
                if self.breaker.is_blacklisted(workflow_id).await? {
                    info!(execution_id = %req.execution_id, %workflow_id, "rejecting blacklisted workflow");
                    self.notify_admin(TelemetryEvent::ExecutionStuck {
                        execution_id: req.execution_id,
                        workflow_id: Some(workflow_id.clone()),
                    })
                    .await;
                    self.write_terminal_and_settle(ExecutionResultRecord {
                        execution_id: req.execution_id,
                        workflow_id: Some(workflow_id.clone()),
                        status: TerminalStatus::Blocked,
                        result_payload: None,
                        error_type: Some(ErrorType::WorkflowBlacklisted),
                        error_message: Some(format!("workflow {workflow_id} is blacklisted")),
                        duration_ms: 0,
                        started_at: Utc::now(),
                        finished_at: Utc::now(),
                    })
                    .await;
                    return Ok(());
                }
            }
        }

        if let Err(err) = self.prewarm.prewarm(&req).await {
            warn!(execution_id = %req.execution_id, %err, "prewarm failed, proceeding anyway");
        }

        let workflow_org = match &req.workflow_id {
            Some(workflow_id) if !req.is_script => {
                self.store.load_workflow(workflow_id).await?.organization_id
            }
            _ => req.organization_id.clone(),
        };

        let cancel = CancellationHandle::new();
        let ctx = prepare_context(&req, workflow_org.as_deref(), cancel);
        let timeout = Duration::from_secs(req.timeout_seconds);

        self.pending.insert(
            req.execution_id,
            PendingExecution {
                workflow_id: req.workflow_id.clone(),
                started_at: Utc::now(),
            },
        );
        self.store_pending_context(&req).await;

        if let Err(err) = self
            .orchestrator()
            .route(req.execution_id, req.workflow_id.clone(), ctx, timeout)
        {
            self.pending.remove(&req.execution_id);
            return Err(err.into());
        }
        Ok(())
    }

    /// Finalization rules (§4.4): maps a `ResultMessage` to a terminal
    /// status, notifies the Circuit Breaker on Stuck, flushes telemetry,
    /// and evicts per-execution cache entries.
    async fn finalize(&self, msg: ResultMessage) {
        let execution_id = msg.execution_id();
        let Some((_, pending)) = self.pending.remove(&execution_id) else {
            warn!(%execution_id, "received result for unknown/already-finalized execution");
            return;
        };

        let status = msg.terminal_status();
        let (result_payload, error_type, error_message, duration_ms) = match &msg {
            ResultMessage::Success { payload, duration_ms, .. } => {
                (Some(payload.clone()), None, None, *duration_ms)
            }
            ResultMessage::Failure {
                error_type,
                error_message,
                duration_ms,
                ..
            } => (None, Some(error_type.clone()), Some(error_message.clone()), *duration_ms),
            ResultMessage::Stuck { elapsed_ms, .. } => (
                None,
                Some(ErrorType::ExecutionStuck),
                Some("execution ignored cancellation past the grace period".to_string()),
                *elapsed_ms,
            ),
        };

        if matches!(status, TerminalStatus::Stuck) {
            if let Some(workflow_id) = &pending.workflow_id {
                if let Err(err) = self.breaker.record_stuck(workflow_id).await {
                    error!(%workflow_id, %err, "failed to record stuck event against circuit breaker");
                }
            }
            self.publish_telemetry(TelemetryEvent::ExecutionStuck {
                execution_id,
                workflow_id: pending.workflow_id.clone(),
            })
            .await;
            self.notify_admin(TelemetryEvent::ExecutionStuck {
                execution_id,
                workflow_id: pending.workflow_id.clone(),
            })
            .await;
        }

        let record = ExecutionResultRecord {
            execution_id,
            workflow_id: pending.workflow_id,
            status,
            result_payload,
            error_type,
            error_message,
            duration_ms,
            started_at: pending.started_at,
            finished_at: Utc::now(),
        };
        self.write_terminal_and_settle(record).await;
        let _ = self.kv.del(&format!("exec:{execution_id}:pending")).await;
    }

    /// Writes the terminal record with bounded retry, then acks or nacks
    /// the broker message accordingly (§4.4: "Broker acks happen only
    /// after the terminal record is durably written or explicitly marked
    /// for retry").
    async fn write_terminal_and_settle(&self, record: ExecutionResultRecord) {
        let execution_id = record.execution_id;
        for attempt in 0..self.retry.max_attempts {
            match self.store.write_execution_terminal(record.clone()).await {
                Ok(()) => {
                    self.broker.ack(execution_id).await;
                    return;
                }
                Err(StoreError::AlreadyFinalized) => {
                    // Idempotent retry landed after an earlier attempt
                    // actually succeeded; treat as success.
                    self.broker.ack(execution_id).await;
                    return;
                }
                Err(err) => {
                    warn!(%execution_id, attempt, %err, "terminal write failed, retrying");
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
            }
        }
        error!(%execution_id, "surrendering on terminal write after exhausting retries");
        self.broker.nack(execution_id).await;
    }

    /// Caches the request as an opaque blob under `exec:{execution_id}:pending`
    /// (§6) so another node's admin surface can see the execution is in
    /// flight even though the in-process `pending` map lives only on the
    /// node that dispatched it. Best-effort: a KV failure here does not
    /// block dispatch, it only degrades cross-node visibility.
    async fn store_pending_context(&self, req: &ExecutionRequest) {
        if let Ok(payload) = serde_json::to_string(req) {
            let key = format!("exec:{}:pending", req.execution_id);
            if let Err(err) = self.kv.set(&key, &payload, None).await {
                warn!(execution_id = %req.execution_id, %err, "failed to cache pending execution context");
            }
        }
    }

    async fn publish_telemetry(&self, event: TelemetryEvent) {
        if let Ok(payload) = serde_json::to_string(&event) {
            let _ = self.kv.publish(TELEMETRY_CHANNEL, &payload).await;
        }
    }

    /// Publishes a platform-admin notification (§7: "Stuck and Blocked
    /// statuses additionally trigger platform-admin notifications"), on top
    /// of whatever telemetry event already went to [`TELEMETRY_CHANNEL`].
    async fn notify_admin(&self, event: TelemetryEvent) {
        if let Ok(payload) = serde_json::to_string(&event) {
            let _ = self
                .kv
                .publish(crate::breaker::ADMIN_NOTIFICATIONS_CHANNEL, &payload)
                .await;
        }
    }

    /// Bounded snapshot of in-flight (dispatched, not yet finalized)
    /// executions, for the admin surface's "list queue" operation (§4.7).
    pub fn list_pending(&self, limit: usize) -> Vec<PendingExecutionSummary> {
        self.pending
            .iter()
            .take(limit)
            .map(|entry| PendingExecutionSummary {
                execution_id: *entry.key(),
                workflow_id: entry.value().workflow_id.clone(),
                started_at: entry.value().started_at,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingExecutionSummary {
    pub execution_id: ExecutionId,
    pub workflow_id: Option<WorkflowId>,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
impl ResultSink for BrokerConsumer {
    async fn on_result(&self, msg: ResultMessage) {
        self.finalize(msg).await;
    }

    async fn on_telemetry(&self, event: TelemetryEvent) {
        self.publish_telemetry(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::kv::InMemoryKvStore;
    use crate::model::WorkflowInfo;
    use crate::runner::{ExecutionContext, Sandbox, SandboxOutcome};
    use crate::store::InMemoryExecutionStore;
    use foreman_core::EngineConfig;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    struct ImmediateSandbox;

    #[async_trait]
    impl Sandbox for ImmediateSandbox {
        async fn execute(&self, _ctx: &ExecutionContext) -> SandboxOutcome {
            SandboxOutcome::Success(serde_json::json!({"ok": true}))
        }
    }

    #[derive(Default)]
    struct RecordingBroker {
        acked: StdMutex<Vec<ExecutionId>>,
        nacked: StdMutex<Vec<ExecutionId>>,
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn ack(&self, execution_id: ExecutionId) {
            self.acked.lock().unwrap().push(execution_id);
        }
        async fn nack(&self, execution_id: ExecutionId) {
            self.nacked.lock().unwrap().push(execution_id);
        }
    }

    fn sample_request(workflow_id: &str, timeout: u64, is_script: bool) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: Uuid::now_v7(),
            workflow_id: if is_script { None } else { Some(workflow_id.to_string()) },
            organization_id: None,
            caller_org_id: None,
            code_ref: "inline".to_string(),
            params: serde_json::json!({}),
            timeout_seconds: timeout,
            is_script,
            enqueued_at: Utc::now(),
        }
    }

    async fn build_consumer() -> (Arc<BrokerConsumer>, Arc<RecordingBroker>, Arc<InMemoryExecutionStore>) {
        let store = Arc::new(InMemoryExecutionStore::new());
        store.seed_workflow(WorkflowInfo {
            workflow_id: "wf-1".to_string(),
            code_ref: "inline".to_string(),
            organization_id: None,
            default_timeout_seconds: 30,
        });
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            kv.clone(),
            store.clone(),
        ));
        let runner = Arc::new(crate::runner::Runner::new(Arc::new(ImmediateSandbox)));
        let config = EngineConfig {
            min_workers: 1,
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let broker = Arc::new(RecordingBroker::default());
        let store_dyn: Arc<dyn ExecutionStore> = store.clone();

        let consumer = Arc::new(BrokerConsumer::new(
            store_dyn,
            kv,
            breaker,
            broker.clone(),
            Arc::new(NoopPrewarm),
        ));
        let orchestrator = Orchestrator::start(config, runner, consumer.clone()).await;
        consumer.attach_orchestrator(orchestrator);
        (consumer, broker, store)
    }

    #[tokio::test]
    async fn rejects_zero_timeout_at_admission() {
        let (consumer, broker, store) = build_consumer().await;
        let req = sample_request("wf-1", 0, false);
        let id = req.execution_id;
        consumer.handle_message(req).await.unwrap();
        assert!(broker.acked.lock().unwrap().contains(&id));
        let record = store
            .write_execution_terminal(ExecutionResultRecord {
                execution_id: Uuid::now_v7(),
                workflow_id: None,
                status: TerminalStatus::Success,
                result_payload: None,
                error_type: None,
                error_message: None,
                duration_ms: 0,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            })
            .await;
        assert!(record.is_ok());
    }

    #[tokio::test]
    async fn blacklisted_workflow_is_blocked_without_dispatch() {
        let (consumer, broker, store) = build_consumer().await;
        store
            .upsert_blacklist_entry(crate::model::BlacklistEntry::manual(
                "wf-1".to_string(),
                "bad actor".to_string(),
                "admin-1".to_string(),
                Utc::now(),
            ))
            .await
            .unwrap();

        let req = sample_request("wf-1", 30, false);
        let id = req.execution_id;
        consumer.handle_message(req).await.unwrap();
        assert!(broker.acked.lock().unwrap().contains(&id));
    }

    #[tokio::test]
    async fn blocked_admission_notifies_platform_admin() {
        let store = Arc::new(InMemoryExecutionStore::new());
        store.seed_workflow(WorkflowInfo {
            workflow_id: "wf-1".to_string(),
            code_ref: "inline".to_string(),
            organization_id: None,
            default_timeout_seconds: 30,
        });
        store
            .upsert_blacklist_entry(crate::model::BlacklistEntry::manual(
                "wf-1".to_string(),
                "bad actor".to_string(),
                "admin-1".to_string(),
                Utc::now(),
            ))
            .await
            .unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            kv.clone(),
            store.clone() as Arc<dyn ExecutionStore>,
        ));
        let runner = Arc::new(crate::runner::Runner::new(Arc::new(ImmediateSandbox)));
        let config = EngineConfig {
            min_workers: 1,
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let broker = Arc::new(RecordingBroker::default());
        let consumer = Arc::new(BrokerConsumer::new(
            store.clone() as Arc<dyn ExecutionStore>,
            kv.clone(),
            breaker,
            broker,
            Arc::new(NoopPrewarm),
        ));
        let orchestrator = Orchestrator::start(config, runner, consumer.clone()).await;
        consumer.attach_orchestrator(orchestrator);

        let mut admin_rx = kv
            .subscribe(crate::breaker::ADMIN_NOTIFICATIONS_CHANNEL)
            .await
            .unwrap();

        let req = sample_request("wf-1", 30, false);
        consumer.handle_message(req).await.unwrap();

        let notification = tokio::time::timeout(Duration::from_secs(1), admin_rx.recv())
            .await
            .expect("timed out waiting for admin notification")
            .expect("admin channel closed");
        assert!(notification.contains("execution_stuck"));
    }

    #[tokio::test]
    async fn admission_caches_pending_context_in_kv() {
        let store = Arc::new(InMemoryExecutionStore::new());
        store.seed_workflow(WorkflowInfo {
            workflow_id: "wf-1".to_string(),
            code_ref: "inline".to_string(),
            organization_id: None,
            default_timeout_seconds: 30,
        });
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            kv.clone(),
            store.clone() as Arc<dyn ExecutionStore>,
        ));
        let runner = Arc::new(crate::runner::Runner::new(Arc::new(ImmediateSandbox)));
        let config = EngineConfig {
            min_workers: 1,
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let broker = Arc::new(RecordingBroker::default());
        let consumer = Arc::new(BrokerConsumer::new(
            store.clone() as Arc<dyn ExecutionStore>,
            kv.clone(),
            breaker,
            broker,
            Arc::new(NoopPrewarm),
        ));
        let orchestrator = Orchestrator::start(config, runner, consumer.clone()).await;
        consumer.attach_orchestrator(orchestrator);

        let req = sample_request("wf-1", 30, false);
        let id = req.execution_id;
        consumer.handle_message(req).await.unwrap();

        let cached = kv.get(&format!("exec:{id}:pending")).await.unwrap();
        assert!(cached.is_some(), "expected the request to be cached under exec:{{id}}:pending");
    }

    #[tokio::test]
    async fn scripts_bypass_the_blacklist_check() {
        let (consumer, _broker, store) = build_consumer().await;
        store
            .upsert_blacklist_entry(crate::model::BlacklistEntry::manual(
                "wf-1".to_string(),
                "bad actor".to_string(),
                "admin-1".to_string(),
                Utc::now(),
            ))
            .await
            .unwrap();

        let req = sample_request("wf-1", 30, true);
        // Scripts carry no workflow_id per sample_request's construction;
        // the call must not error even though a blacklist entry exists
        // for "wf-1" in the store.
        consumer.handle_message(req).await.unwrap();
    }
}
