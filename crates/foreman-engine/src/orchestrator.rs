//! Process Pool Manager / Orchestrator (§4.3): owns Worker Processes,
//! ensures at least one Active process exists at all times, routes work,
//! and forwards results.
//!
//! Grounded on `WorkerPool`'s lifecycle methods (`start`/`shutdown`
//! polling a deadline, background loops spawned from `start()`) and
//! `executor.rs`'s loop-driving style. A "Worker Process Record" here is
//! an `Entry` tracked in a `DashMap<u32, Entry>`; the cycle the spec
//! warns about (Worker Process <-> Orchestrator) is broken the same way
//! the teacher breaks Orchestrator <-> WorkerPool: the Orchestrator holds
//! the other side's channel endpoints, never a back-reference.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use foreman_core::EngineConfig;
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::model::{ExecutionId, ProcessState, ResultMessage, TelemetryEvent, WorkflowId};
use crate::process::{ControlMessage, Dispatch, ProcessEvent, WorkerProcess, WorkerProcessHandle};
use crate::runner::{ExecutionContext, Runner};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no active worker process is available")]
    NoActiveWorker,
    #[error("worker process {0} not found")]
    NotFound(u32),
    #[error("work channel to worker process {0} is full")]
    WorkChannelFull(u32),
    #[error("timed out waiting for graceful shutdown")]
    ShutdownTimeout,
}

/// Receives forwarded [`ResultMessage`]s and heartbeat snapshots. The
/// Broker Consumer implements this; the Orchestrator never writes to the
/// store or telemetry channel itself (§5: single logical writer per
/// resource).
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn on_result(&self, msg: ResultMessage);
    async fn on_telemetry(&self, event: TelemetryEvent) {
        let _ = event;
    }
}

struct Entry {
    handle: WorkerProcessHandle,
    last_state: Mutex<ProcessState>,
}

/// The per-node Orchestrator. Cheaply cloneable; internals are `Arc`-ed.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    runner: Arc<Runner>,
    sink: Arc<dyn ResultSink>,
    workers: DashMap<u32, Entry>,
    next_pid: AtomicU64,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    /// Constructs the Orchestrator and spawns `min_workers` Active
    /// processes so routing never has to wait on a cold start in the
    /// common case.
    pub async fn start(config: EngineConfig, runner: Arc<Runner>, sink: Arc<dyn ResultSink>) -> Self {
        let orchestrator = Self {
            inner: Arc::new(Inner {
                config,
                runner,
                sink,
                workers: DashMap::new(),
                next_pid: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        };
        for _ in 0..orchestrator.inner.config.min_workers {
            orchestrator.spawn_worker();
        }
        orchestrator.spawn_monitor_loop();
        orchestrator
    }

    /// `Route(execution_id, context)` (§4.3): non-blocking, picks the
    /// current Active worker, spawning one first if none exists.
    #[instrument(skip(self, context))]
    pub fn route(
        &self,
        execution_id: ExecutionId,
        workflow_id: Option<WorkflowId>,
        context: ExecutionContext,
        timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        let pid = self.active_pid().unwrap_or_else(|| self.spawn_worker());
        let entry = self
            .inner
            .workers
            .get(&pid)
            .ok_or(OrchestratorError::NotFound(pid))?;
        entry
            .handle
            .work_tx
            .try_send(Dispatch {
                execution_id,
                workflow_id,
                context,
                timeout,
            })
            .map_err(|_| OrchestratorError::WorkChannelFull(pid))
    }

    /// `RecycleProcess(pid, reason)` (§4.3): never destructive — the
    /// targeted process enters PendingKill via its control channel. A
    /// replacement is spawned by the generic Active->non-Active
    /// transition hook below, not here, so this stays a thin command.
    pub async fn recycle_process(&self, pid: u32, reason: String) -> Result<(), OrchestratorError> {
        let entry = self.inner.workers.get(&pid).ok_or(OrchestratorError::NotFound(pid))?;
        entry
            .handle
            .control_tx
            .send(ControlMessage::Recycle { reason })
            .await
            .map_err(|_| OrchestratorError::NotFound(pid))
    }

    /// `Stop()` (§4.3): marks every tracked process Draining/Exiting and
    /// waits up to `graceful_shutdown_seconds` for residuals, then gives
    /// up (the caller is expected to hard-exit the process afterward).
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let pids: Vec<u32> = self.inner.workers.iter().map(|e| *e.key()).collect();
        for pid in &pids {
            if let Some(entry) = self.inner.workers.get(pid) {
                let _ = entry.handle.control_tx.send(ControlMessage::Shutdown).await;
            }
        }

        let deadline = Instant::now() + self.inner.config.graceful_shutdown;
        while Instant::now() < deadline {
            if self.inner.workers.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.inner.workers.is_empty() {
            Ok(())
        } else {
            warn!(remaining = self.inner.workers.len(), "graceful shutdown timed out");
            Err(OrchestratorError::ShutdownTimeout)
        }
    }

    pub fn active_worker_count(&self) -> usize {
        self.inner
            .workers
            .iter()
            .filter(|e| *e.last_state.lock() == ProcessState::Active)
            .count()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    fn active_pid(&self) -> Option<u32> {
        self.inner
            .workers
            .iter()
            .find(|e| *e.last_state.lock() == ProcessState::Active)
            .map(|e| *e.key())
    }

    /// Spawns a new Active Worker Process, wires its event stream back
    /// into this Orchestrator, and returns its pid.
    fn spawn_worker(&self) -> u32 {
        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
        let handle = WorkerProcess::spawn(
            pid,
            self.inner.runner.clone(),
            self.inner.config.thread_pool_size,
            self.inner.config.cancel_grace,
            self.inner.config.recycle_after_executions,
            self.inner.config.heartbeat_interval,
        );

        self.inner.workers.insert(
            pid,
            Entry {
                handle,
                last_state: Mutex::new(ProcessState::Active),
            },
        );

        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.drain_events(pid).await });

        info!(pid, "spawned worker process");
        pid
    }

    /// Owns one worker's events channel for its entire lifetime: forwards
    /// results to the sink, reacts to state transitions (proactive
    /// replacement, telemetry), and garbage-collects the entry once the
    /// process reaches Exiting.
    async fn drain_events(&self, pid: u32) {
        let events = match self.inner.workers.get(&pid) {
            Some(e) => e.handle.events.clone(),
            None => return,
        };
        loop {
            let event = {
                let mut rx = events.lock().await;
                rx.recv().await
            };
            let Some(event) = event else { break };

            match event {
                ProcessEvent::Result(msg) => self.inner.sink.on_result(msg).await,
                ProcessEvent::Heartbeat(snapshot) => {
                    self.inner
                        .sink
                        .on_telemetry(TelemetryEvent::WorkerHeartbeat { snapshot })
                        .await;
                }
                ProcessEvent::StateChange { new_state, reason } => {
                    self.handle_state_change(pid, new_state, &reason).await;
                    if new_state == ProcessState::Exiting {
                        self.inner.workers.remove(&pid);
                        break;
                    }
                }
            }
        }
    }

    async fn handle_state_change(&self, pid: u32, new_state: ProcessState, reason: &str) {
        let was_active = if let Some(entry) = self.inner.workers.get(&pid) {
            let mut last = entry.last_state.lock();
            let was_active = *last == ProcessState::Active;
            *last = new_state;
            was_active
        } else {
            false
        };

        self.inner
            .sink
            .on_telemetry(TelemetryEvent::ProcessStateChanged {
                worker_id: pid.to_string(),
                pid,
                new_state,
                reason: reason.to_string(),
            })
            .await;

        // §4.3: "When a Worker Process's state transitions Active ->
        // Draining (for any reason), the Orchestrator immediately spawns
        // a new Active worker." PendingKill is Draining's manual-recycle
        // sibling and gets the same treatment.
        let left_active = was_active && matches!(new_state, ProcessState::Draining | ProcessState::PendingKill);
        if left_active && !self.inner.shutting_down.load(Ordering::SeqCst) {
            self.spawn_worker();
        }
    }

    /// Monitor loop (§4.3, every ~1s): ensures at least one Active
    /// process, tops up to `min_workers`, and never exceeds `max_workers`
    /// tracked processes.
    fn spawn_monitor_loop(&self) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if orchestrator.inner.shutting_down.load(Ordering::SeqCst) {
                    break;
                }

                if orchestrator.active_worker_count() == 0 {
                    orchestrator.spawn_worker();
                    continue;
                }

                let active = orchestrator.active_worker_count();
                let total = orchestrator.worker_count();
                if active < orchestrator.inner.config.min_workers && total < orchestrator.inner.config.max_workers {
                    orchestrator.spawn_worker();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scope;
    use crate::runner::{CancellationHandle, Sandbox, SandboxOutcome};
    use tokio::sync::Mutex as AsyncMutex;
    use uuid::Uuid;

    struct ImmediateSandbox;

    #[async_trait]
    impl Sandbox for ImmediateSandbox {
        async fn execute(&self, _ctx: &ExecutionContext) -> SandboxOutcome {
            SandboxOutcome::Success(serde_json::json!({"ok": true}))
        }
    }

    struct CollectingSink {
        results: AsyncMutex<Vec<ResultMessage>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                results: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ResultSink for CollectingSink {
        async fn on_result(&self, msg: ResultMessage) {
            self.results.lock().await.push(msg);
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            min_workers: 1,
            max_workers: 4,
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn keeps_at_least_one_active_process() {
        let runner = Arc::new(Runner::new(Arc::new(ImmediateSandbox)));
        let sink = CollectingSink::new();
        let orchestrator = Orchestrator::start(test_config(), runner, sink).await;
        assert_eq!(orchestrator.active_worker_count(), 1);
    }

    #[tokio::test]
    async fn route_dispatches_and_reports_result() {
        let runner = Arc::new(Runner::new(Arc::new(ImmediateSandbox)));
        let sink = CollectingSink::new();
        let orchestrator = Orchestrator::start(test_config(), runner, sink.clone()).await;

        let id = Uuid::now_v7();
        let ctx = ExecutionContext {
            execution_id: id,
            scope: Scope::Global,
            params: serde_json::json!({}),
            cancel: CancellationHandle::new(),
        };
        orchestrator
            .route(id, Some("wf-1".to_string()), ctx, Duration::from_secs(5))
            .unwrap();

        for _ in 0..20 {
            if !sink.results.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let results = sink.results.lock().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], ResultMessage::Success { .. }));
    }

    #[tokio::test]
    async fn recycle_spawns_a_replacement_before_the_old_one_exits() {
        let runner = Arc::new(Runner::new(Arc::new(ImmediateSandbox)));
        let sink = CollectingSink::new();
        let orchestrator = Orchestrator::start(test_config(), runner, sink).await;
        let pid = orchestrator.active_pid().unwrap();

        orchestrator.recycle_process(pid, "manual".to_string()).await.unwrap();

        let mut saw_two_workers = false;
        for _ in 0..20 {
            if orchestrator.worker_count() >= 2 {
                saw_two_workers = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(saw_two_workers, "expected a replacement worker to be spawned");
        assert_eq!(orchestrator.active_worker_count(), 1);
    }
}
