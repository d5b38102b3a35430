//! Worker Process (§4.2): hosts up to `thread_pool_size` concurrent
//! Runners, accepts work on a channel, monitors each for timeout/stuck,
//! reports results and state changes.
//!
//! Grounded on the teacher's `WorkerPool` (start/shutdown lifecycle,
//! semaphore-bounded concurrency, non-blocking background loops) and
//! `TimeoutManager` (pure `check_*`-style timeout logic), adapted from an
//! activity-claiming loop to direct dispatch-with-timeout.
//!
//! A "Worker Process" here is a dedicated Tokio task with its own
//! supervisor loop and channel endpoints, not a literal forked OS process —
//! the channel-only contract in §5 ("no shared mutable memory... all
//! coordination is via typed messages") is identical either way, and a
//! task avoids the complexity of re-exec'ing this binary as a subprocess.
//! The one place real OS-level isolation matters for fidelity — a sandbox
//! that never yields control even to its own host thread — is kept: each
//! execution still runs on its own real `std::thread`, so a stuck sandbox
//! cannot starve the async supervisor loop that is trying to detect it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::model::{
    CurrentExecutionSnapshot, ErrorType, ExecutionId, ExecutionStatus, HeartbeatSnapshot,
    ProcessState, ResultMessage, WorkflowId,
};
use crate::runner::{CancellationHandle, ExecutionContext, Runner};

/// Work dispatched from the Orchestrator to a Worker Process.
#[derive(Debug)]
pub struct Dispatch {
    pub execution_id: ExecutionId,
    pub workflow_id: Option<WorkflowId>,
    pub context: ExecutionContext,
    pub timeout: Duration,
}

/// Control messages the Orchestrator sends a Worker Process.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Recycle { reason: String },
    Shutdown,
}

/// Events a Worker Process emits on its result channel.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Result(ResultMessage),
    StateChange {
        new_state: ProcessState,
        reason: String,
    },
    /// Periodic snapshot the Orchestrator folds into the node-wide
    /// heartbeat the Registry publishes (§4.2, §4.6).
    Heartbeat(HeartbeatSnapshot),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerProcessError {
    #[error("worker process is not accepting work (state = {0:?})")]
    NotAccepting(ProcessState),
}

/// In-memory tracking of one live execution inside a Worker Process.
struct ExecutionHandle {
    workflow_id: Option<WorkflowId>,
    started_at: Instant,
    timeout: Duration,
    cancel: CancellationHandle,
    cancel_requested_at: Option<Instant>,
    status: ExecutionStatus,
    /// Non-blocking channel the hosting OS thread reports its outcome on.
    outcome_rx: std::sync::mpsc::Receiver<ResultMessage>,
}

/// Handle the Orchestrator holds for a spawned Worker Process: channel
/// endpoints plus a cheap read of its current state.
pub struct WorkerProcessHandle {
    pub pid: u32,
    pub work_tx: mpsc::Sender<Dispatch>,
    pub control_tx: mpsc::Sender<ControlMessage>,
    pub state_rx: watch::Receiver<ProcessState>,
    pub events: Arc<tokio::sync::Mutex<mpsc::Receiver<ProcessEvent>>>,
}

/// The Worker Process itself: owns the supervisor loop. Construct with
/// [`WorkerProcess::spawn`], which returns this struct's [`WorkerProcessHandle`]
/// counterpart and drives the supervisor loop on a `tokio::spawn`ed task.
pub struct WorkerProcess {
    pid: u32,
    thread_pool_size: usize,
    cancel_grace: Duration,
    recycle_after: u64,
    heartbeat_interval: Duration,
    last_heartbeat: Instant,
    state: ProcessState,
    state_tx: watch::Sender<ProcessState>,
    started_at: Instant,
    executions_completed: u64,
    current_executions: HashMap<ExecutionId, ExecutionHandle>,
    stuck_executions: HashSet<ExecutionId>,
    runner: Arc<Runner>,
    work_rx: mpsc::Receiver<Dispatch>,
    control_rx: mpsc::Receiver<ControlMessage>,
    events_tx: mpsc::Sender<ProcessEvent>,
}

impl WorkerProcess {
    /// Spawns the supervisor loop on its own Tokio task and returns the
    /// handle the Orchestrator uses to talk to it.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        pid: u32,
        runner: Arc<Runner>,
        thread_pool_size: usize,
        cancel_grace: Duration,
        recycle_after: u64,
        heartbeat_interval: Duration,
    ) -> WorkerProcessHandle {
        let (work_tx, work_rx) = mpsc::channel(thread_pool_size.max(1) * 4);
        let (control_tx, control_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(thread_pool_size.max(1) * 4 + 16);
        let (state_tx, state_rx) = watch::channel(ProcessState::Active);

        let process = WorkerProcess {
            pid,
            thread_pool_size,
            cancel_grace,
            recycle_after,
            heartbeat_interval,
            last_heartbeat: Instant::now(),
            state: ProcessState::Active,
            state_tx,
            started_at: Instant::now(),
            executions_completed: 0,
            current_executions: HashMap::new(),
            stuck_executions: HashSet::new(),
            runner,
            work_rx,
            control_rx,
            events_tx,
        };

        tokio::spawn(process.supervise());

        WorkerProcessHandle {
            pid,
            work_tx,
            control_tx,
            state_rx,
            events: Arc::new(tokio::sync::Mutex::new(events_rx)),
        }
    }

    #[instrument(skip(self), fields(pid = self.pid))]
    async fn supervise(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            ticker.tick().await;

            while let Ok(dispatch) = self.work_rx.try_recv() {
                self.accept(dispatch);
            }

            while let Ok(ctrl) = self.control_rx.try_recv() {
                self.handle_control(ctrl).await;
            }

            self.tick_executions().await;
            self.maybe_emit_heartbeat().await;

            if self.state == ProcessState::Exiting {
                break;
            }
        }
        info!(pid = self.pid, "worker process exiting");
    }

    async fn maybe_emit_heartbeat(&mut self) {
        if self.last_heartbeat.elapsed() < self.heartbeat_interval {
            return;
        }
        self.last_heartbeat = Instant::now();
        let snapshot = self.snapshot();
        let _ = self.events_tx.send(ProcessEvent::Heartbeat(snapshot)).await;
    }

    /// Builds the periodic heartbeat snapshot (§4.2, §4.6): per-process
    /// state, memory usage, uptime, completions, and the current execution
    /// list.
    fn snapshot(&self) -> HeartbeatSnapshot {
        HeartbeatSnapshot {
            worker_id: self.pid.to_string(),
            pid: self.pid,
            state: self.state,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            executions_completed: self.executions_completed,
            current_executions: self
                .current_executions
                .iter()
                .map(|(id, h)| CurrentExecutionSnapshot {
                    execution_id: *id,
                    workflow_id: h.workflow_id.clone(),
                    elapsed_ms: h.started_at.elapsed().as_millis() as u64,
                    status: h.status,
                })
                .collect(),
            memory_bytes: current_process_memory_bytes(),
        }
    }

    /// Rejects work if not Active, per the work_channel contract in §4.2.
    fn accept(&mut self, dispatch: Dispatch) {
        if self.state != ProcessState::Active {
            warn!(
                pid = self.pid,
                execution_id = %dispatch.execution_id,
                "rejecting dispatch, process is not Active"
            );
            return;
        }
        if self.current_executions.len() >= self.thread_pool_size {
            warn!(pid = self.pid, "rejecting dispatch, pool at capacity");
            return;
        }

        let (outcome_tx, outcome_rx) = std::sync::mpsc::channel();
        let cancel = dispatch.context.cancel.clone();
        let runner = self.runner.clone();
        let ctx = dispatch.context;
        let started_at = Instant::now();

        let execution_id = dispatch.execution_id;
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build per-execution runtime");
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                rt.block_on(runner.run(ctx, started_at))
            }));
            let result = outcome.unwrap_or_else(|payload| {
                let message = panic_message(&payload);
                ResultMessage::Failure {
                    execution_id,
                    error_type: ErrorType::RuntimeError,
                    error_message: message,
                    duration_ms: started_at.elapsed().as_millis() as u64,
                }
            });
            // Best-effort: if the supervisor already abandoned this handle
            // (process is Exiting and dropped the receiver), there is
            // nothing left to notify.
            let _ = outcome_tx.send(result);
        });

        self.current_executions.insert(
            dispatch.execution_id,
            ExecutionHandle {
                workflow_id: dispatch.workflow_id,
                started_at,
                timeout: dispatch.timeout,
                cancel,
                cancel_requested_at: None,
                status: ExecutionStatus::Running,
                outcome_rx,
            },
        );
    }

    async fn handle_control(&mut self, ctrl: ControlMessage) {
        match ctrl {
            ControlMessage::Recycle { reason } => {
                if matches!(self.state, ProcessState::Active | ProcessState::Draining) {
                    self.transition(ProcessState::PendingKill, reason).await;
                }
            }
            ControlMessage::Shutdown => {
                if self.state == ProcessState::Active && self.current_executions.is_empty() {
                    self.transition(ProcessState::Exiting, "shutdown".to_string())
                        .await;
                } else {
                    self.transition(ProcessState::Draining, "shutdown".to_string())
                        .await;
                }
            }
        }
    }

    async fn transition(&mut self, new_state: ProcessState, reason: String) {
        if self.state == new_state {
            return;
        }
        debug!(pid = self.pid, ?new_state, %reason, "worker process state change");
        self.state = new_state;
        let _ = self.state_tx.send(new_state);
        let _ = self
            .events_tx
            .send(ProcessEvent::StateChange { new_state, reason })
            .await;
    }

    /// One supervisor tick's worth of the timeout/stuck protocol (§4.2).
    /// Completion is always observed before timeout is enforced for a
    /// given handle within the same tick (§8 boundary behaviour).
    async fn tick_executions(&mut self) {
        let now = Instant::now();
        let mut finished = Vec::new();
        let mut went_stuck = false;

        for (id, handle) in self.current_executions.iter_mut() {
            if let Ok(mut msg) = handle.outcome_rx.try_recv() {
                if handle.cancel_requested_at.is_some() {
                    reclassify_cancelled_as_timeout(&mut msg);
                }
                finished.push((*id, msg, false));
                continue;
            }

            if now.duration_since(handle.started_at) > handle.timeout
                && handle.cancel_requested_at.is_none()
            {
                handle.cancel.cancel();
                handle.cancel_requested_at = Some(now);
                handle.status = ExecutionStatus::Cancelling;
                continue;
            }

            if let Some(requested_at) = handle.cancel_requested_at {
                if now.duration_since(requested_at) > self.cancel_grace
                    && handle.status != ExecutionStatus::Stuck
                {
                    handle.status = ExecutionStatus::Stuck;
                    went_stuck = true;
                    let elapsed_ms = now.duration_since(handle.started_at).as_millis() as u64;
                    finished.push((
                        *id,
                        ResultMessage::Stuck {
                            execution_id: *id,
                            elapsed_ms,
                        },
                        true,
                    ));
                }
            }
        }

        for (id, msg, is_stuck) in finished {
            if is_stuck {
                self.stuck_executions.insert(id);
                // The handle is not removed: per §4.2, stuck executions are
                // abandoned, not cleaned up, and ride the process down when
                // it exits. Only non-stuck completions remove the handle.
            } else {
                self.current_executions.remove(&id);
                self.executions_completed += 1;
            }
            let _ = self.events_tx.send(ProcessEvent::Result(msg)).await;
        }

        if went_stuck && self.state == ProcessState::Active {
            self.transition(ProcessState::Draining, "stuck_execution".to_string())
                .await;
        }

        if self.recycle_after > 0
            && self.state == ProcessState::Active
            && self.executions_completed >= self.recycle_after
        {
            self.transition(
                ProcessState::Draining,
                "recycle_after_executions".to_string(),
            )
            .await;
        }

        self.maybe_exit().await;
    }

    /// Draining/PendingKill -> Exiting once every non-stuck execution has
    /// reported terminal; stuck executions are abandoned, not waited for.
    async fn maybe_exit(&mut self) {
        if !matches!(self.state, ProcessState::Draining | ProcessState::PendingKill) {
            return;
        }
        let healthy_remaining = self
            .current_executions
            .keys()
            .filter(|id| !self.stuck_executions.contains(*id))
            .count();
        if healthy_remaining == 0 {
            self.transition(ProcessState::Exiting, "drain_complete".to_string())
                .await;
        }
    }

}

/// Resident memory of the host OS process, for the heartbeat snapshot
/// (§4.6: "memory usage"). All `WorkerProcess` tasks in this binary share
/// one real OS process (see module docs), so every snapshot reports the
/// same reading; that matches a real multi-process deployment where each
/// Worker Process would report its own.
fn current_process_memory_bytes() -> Option<u64> {
    use sysinfo::{Pid, ProcessesToUpdate, System};
    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory())
}

/// Extracts a human-readable message from a caught sandbox panic payload
/// (§9: "translate any stray panics into Failure{error_type=RuntimeError}").
fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "sandbox panicked".to_string()
    }
}

fn reclassify_cancelled_as_timeout(msg: &mut ResultMessage) {
    if let ResultMessage::Failure { error_type, .. } = msg {
        if *error_type == ErrorType::Cancelled {
            *error_type = ErrorType::Timeout;
        }
    }
}

/// Generates pseudo-PIDs for spawned Worker Processes (this engine's
/// "processes" are Tokio tasks, not forked OS processes; see module docs).
pub fn next_pid() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scope;
    use crate::runner::{Sandbox, SandboxOutcome};
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;
    use uuid::Uuid;

    struct ImmediateSandbox;

    #[async_trait]
    impl Sandbox for ImmediateSandbox {
        async fn execute(&self, _ctx: &ExecutionContext) -> SandboxOutcome {
            SandboxOutcome::Success(serde_json::json!({"ok": true, "n": 42}))
        }
    }

    struct StuckSandbox;

    #[async_trait]
    impl Sandbox for StuckSandbox {
        async fn execute(&self, _ctx: &ExecutionContext) -> SandboxOutcome {
            // Never observes cancellation: a tight, never-yielding loop.
            loop {
                std::hint::spin_loop();
            }
        }
    }

    /// Sleeps far longer than any timeout used below, but cooperatively:
    /// it polls `cancel` instead of spinning, so a timeout-triggered cancel
    /// wakes it well inside the grace period (S2).
    struct CooperativeSleepSandbox;

    #[async_trait]
    impl Sandbox for CooperativeSleepSandbox {
        async fn execute(&self, ctx: &ExecutionContext) -> SandboxOutcome {
            tokio::select! {
                _ = tokio::time::sleep(StdDuration::from_secs(5)) => {
                    SandboxOutcome::Success(serde_json::json!({"ok": true}))
                }
                _ = ctx.cancel.cancelled() => {
                    SandboxOutcome::Failure(crate::runner::SandboxError::Cancelled)
                }
            }
        }
    }

    /// One execution id spins forever (never observes cancellation); every
    /// other execution sleeps briefly and succeeds. Used for the drain test
    /// (S4), where a single process hosts both a stuck and a healthy
    /// execution concurrently.
    struct PartlyStuckSandbox {
        stuck_id: ExecutionId,
    }

    #[async_trait]
    impl Sandbox for PartlyStuckSandbox {
        async fn execute(&self, ctx: &ExecutionContext) -> SandboxOutcome {
            if ctx.execution_id == self.stuck_id {
                loop {
                    std::hint::spin_loop();
                }
            }
            tokio::time::sleep(StdDuration::from_millis(300)).await;
            SandboxOutcome::Success(serde_json::json!({"ok": true}))
        }
    }

    fn ctx(id: ExecutionId) -> ExecutionContext {
        ExecutionContext {
            execution_id: id,
            scope: Scope::Global,
            params: serde_json::json!({}),
            cancel: CancellationHandle::new(),
        }
    }

    struct PanickingSandbox;

    #[async_trait]
    impl Sandbox for PanickingSandbox {
        async fn execute(&self, _ctx: &ExecutionContext) -> SandboxOutcome {
            panic!("sandbox exploded");
        }
    }

    #[tokio::test]
    async fn sandbox_panic_is_reported_as_runtime_error() {
        let runner = Arc::new(Runner::new(Arc::new(PanickingSandbox)));
        let handle = WorkerProcess::spawn(
            next_pid(),
            runner,
            4,
            StdDuration::from_secs(10),
            0,
            StdDuration::from_secs(3600),
        );

        let id = Uuid::now_v7();
        handle
            .work_tx
            .send(Dispatch {
                execution_id: id,
                workflow_id: Some("wf-1".to_string()),
                context: ctx(id),
                timeout: StdDuration::from_secs(30),
            })
            .await
            .unwrap();

        let mut events = handle.events.lock().await;
        let event = timeout(StdDuration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for result")
            .expect("channel closed");

        match event {
            ProcessEvent::Result(ResultMessage::Failure {
                error_type,
                error_message,
                ..
            }) => {
                assert_eq!(error_type, ErrorType::RuntimeError);
                assert!(error_message.contains("sandbox exploded"));
            }
            other => panic!("expected Failure(RuntimeError), got {other:?}"),
        }
        assert_eq!(*handle.state_rx.borrow(), ProcessState::Active);
    }

    #[tokio::test]
    async fn happy_path_reports_success_and_stays_active() {
        let runner = Arc::new(Runner::new(Arc::new(ImmediateSandbox)));
        let handle = WorkerProcess::spawn(
            next_pid(),
            runner,
            4,
            StdDuration::from_secs(10),
            0,
            StdDuration::from_secs(3600),
        );

        let id = Uuid::now_v7();
        handle
            .work_tx
            .send(Dispatch {
                execution_id: id,
                workflow_id: Some("wf-1".to_string()),
                context: ctx(id),
                timeout: StdDuration::from_secs(30),
            })
            .await
            .unwrap();

        let mut events = handle.events.lock().await;
        let event = timeout(StdDuration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for result")
            .expect("channel closed");

        match event {
            ProcessEvent::Result(ResultMessage::Success { payload, .. }) => {
                assert_eq!(payload, serde_json::json!({"ok": true, "n": 42}));
            }
            other => panic!("expected Success result, got {other:?}"),
        }
        assert_eq!(*handle.state_rx.borrow(), ProcessState::Active);
    }

    #[tokio::test]
    async fn stuck_execution_drains_the_process() {
        let runner = Arc::new(Runner::new(Arc::new(StuckSandbox)));
        // Short timeout and short grace so the test completes quickly.
        let handle = WorkerProcess::spawn(
            next_pid(),
            runner,
            1,
            StdDuration::from_millis(200),
            0,
            StdDuration::from_secs(3600),
        );

        let id = Uuid::now_v7();
        handle
            .work_tx
            .send(Dispatch {
                execution_id: id,
                workflow_id: Some("wf-1".to_string()),
                context: ctx(id),
                timeout: StdDuration::from_millis(100),
            })
            .await
            .unwrap();

        let mut events = handle.events.lock().await;
        let mut saw_stuck = false;
        let mut saw_draining = false;
        for _ in 0..10 {
            let event = timeout(StdDuration::from_secs(2), events.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            match event {
                ProcessEvent::Result(ResultMessage::Stuck { .. }) => saw_stuck = true,
                ProcessEvent::StateChange {
                    new_state: ProcessState::Draining,
                    ..
                } => saw_draining = true,
                _ => {}
            }
            if saw_stuck && saw_draining {
                break;
            }
        }
        assert!(saw_stuck, "expected a Stuck result message");
        assert!(saw_draining, "expected the process to start Draining");
    }

    /// S2: a timeout-triggered cancel that the sandbox observes cooperatively
    /// must settle as Timeout well before the grace period would mark it
    /// Stuck, and must not disturb the worker's Active state.
    #[tokio::test]
    async fn cooperative_timeout_reports_timeout_not_stuck() {
        let runner = Arc::new(Runner::new(Arc::new(CooperativeSleepSandbox)));
        let handle = WorkerProcess::spawn(
            next_pid(),
            runner,
            1,
            StdDuration::from_secs(10),
            0,
            StdDuration::from_secs(3600),
        );

        let id = Uuid::now_v7();
        handle
            .work_tx
            .send(Dispatch {
                execution_id: id,
                workflow_id: Some("wf-1".to_string()),
                context: ctx(id),
                timeout: StdDuration::from_millis(100),
            })
            .await
            .unwrap();

        let mut events = handle.events.lock().await;
        let event = timeout(StdDuration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for result")
            .expect("channel closed");

        match event {
            ProcessEvent::Result(ResultMessage::Failure { error_type, .. }) => {
                assert_eq!(error_type, crate::model::ErrorType::Timeout);
            }
            other => panic!("expected Failure(Timeout), got {other:?}"),
        }
        assert_eq!(*handle.state_rx.borrow(), ProcessState::Active);
    }

    /// S4: once one execution on a worker goes Stuck, the worker drains but
    /// must let its other, healthy execution run to completion rather than
    /// cancelling it.
    #[tokio::test]
    async fn drain_preserves_healthy_work() {
        let stuck_id = Uuid::now_v7();
        let runner = Arc::new(Runner::new(Arc::new(PartlyStuckSandbox { stuck_id })));
        let handle = WorkerProcess::spawn(
            next_pid(),
            runner,
            2,
            StdDuration::from_millis(200),
            0,
            StdDuration::from_secs(3600),
        );

        handle
            .work_tx
            .send(Dispatch {
                execution_id: stuck_id,
                workflow_id: Some("wf-stuck".to_string()),
                context: ctx(stuck_id),
                timeout: StdDuration::from_millis(50),
            })
            .await
            .unwrap();

        let healthy_id = Uuid::now_v7();
        handle
            .work_tx
            .send(Dispatch {
                execution_id: healthy_id,
                workflow_id: Some("wf-healthy".to_string()),
                context: ctx(healthy_id),
                timeout: StdDuration::from_secs(30),
            })
            .await
            .unwrap();

        let mut events = handle.events.lock().await;
        let mut saw_draining = false;
        let mut healthy_status = None;
        for _ in 0..20 {
            let event = timeout(StdDuration::from_secs(3), events.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            match event {
                ProcessEvent::StateChange {
                    new_state: ProcessState::Draining,
                    ..
                } => saw_draining = true,
                ProcessEvent::Result(msg) if msg.execution_id() == healthy_id => {
                    healthy_status = Some(msg.terminal_status());
                }
                _ => {}
            }
            if saw_draining && healthy_status.is_some() {
                break;
            }
        }
        assert!(saw_draining, "expected the process to start Draining");
        assert_eq!(healthy_status, Some(crate::model::TerminalStatus::Success));
    }
}
