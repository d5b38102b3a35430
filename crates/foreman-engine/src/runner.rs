//! Execution Runner (§4.1): drives one execution from "context ready" to
//! terminal outcome, cooperating with cancellation.
//!
//! Grounded on the teacher's `ActivityContext`/`CancellationHandle`: a
//! one-shot `Arc<AtomicBool>` cancel signal, readable from any thread
//! without locking, plus an async `cancelled()` future for code that wants
//! to `tokio::select!` on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{ErrorType, ExecutionId, ExecutionRequest, ResultMessage, Scope};

/// One-shot, idempotent cancellation flag shared between the Worker
/// Process supervisor and the sandbox running inside a worker thread.
///
/// Setting it twice is a no-op; the grace-period clock is started by the
/// Worker Process the first time it calls [`CancellationHandle::cancel`],
/// not by anything this type does.
#[derive(Clone, Debug)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested. Intended for use in
    /// `tokio::select!` inside sandbox capability implementations that can
    /// yield; a tight CPU loop that never awaits will never observe this,
    /// which is exactly the "stuck" case the Worker Process detects instead.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Context handed to the sandbox: scope, parameters, and the cancellation
/// signal. Capability objects (storage, config, knowledge, files, ...) are
/// external collaborators not modeled here; they receive this context and
/// are expected to check `cancel` before long operations.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub scope: Scope,
    pub params: Value,
    pub cancel: CancellationHandle,
}

impl ExecutionContext {
    /// Computes the effective tenant scope per §4.1: org-scoped workflow
    /// uses its own org; a global workflow uses the caller's org; if both
    /// are absent, global scope. Callers may still override explicitly on
    /// a per-capability-call basis; that override is outside this function.
    pub fn resolve_scope(workflow_org: Option<&str>, caller_org: Option<&str>) -> Scope {
        match (workflow_org, caller_org) {
            (Some(org), _) => Scope::Organization {
                org_id: org.to_string(),
            },
            (None, Some(org)) => Scope::Organization {
                org_id: org.to_string(),
            },
            (None, None) => Scope::Global,
        }
    }
}

/// Outcome of invoking the sandbox, before the Runner classifies it into a
/// [`ResultMessage`].
pub enum SandboxOutcome {
    Success(Value),
    Failure(SandboxError),
}

/// Errors the sandbox may surface. `Cancelled` is raised by capability
/// objects that observe `cancel_signal` before a long operation.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("user error: {0}")]
    User(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("execution cancelled")]
    Cancelled,
}

/// The pluggable sandbox boundary. The actual sandbox that interprets
/// workflow code is an external collaborator (`Execute(ctx, code, params)`
/// is modeled here as a pure async function); this engine ships an
/// in-process implementation suitable for tests and trusted embedded code,
/// and treats any other sandbox (subprocess, WASM, language bridge) as a
/// different implementation of this same trait.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> SandboxOutcome;
}

/// Drives one execution to completion. Never blocks indefinitely on behalf
/// of the sandbox — timeout enforcement belongs to the Worker Process, not
/// here.
pub struct Runner {
    sandbox: Arc<dyn Sandbox>,
}

impl Runner {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }

    /// `Run(handle) -> ResultMessage` from §4.1. `started_at` is passed in
    /// rather than taken internally so duration is measured from the
    /// moment the Worker Process actually dispatched the execution, not
    /// from when this function happens to be called.
    pub async fn run(&self, ctx: ExecutionContext, started_at: Instant) -> ResultMessage {
        let execution_id = ctx.execution_id;
        let outcome = self.sandbox.execute(&ctx).await;
        let duration_ms = started_at.elapsed().as_millis() as u64;

        match outcome {
            SandboxOutcome::Success(payload) => ResultMessage::Success {
                execution_id,
                payload,
                duration_ms,
            },
            SandboxOutcome::Failure(SandboxError::Cancelled) => {
                // The supervisor is the only component that knows whether
                // this was a timeout-triggered cancel or not; it
                // reclassifies Cancelled->Timeout itself when it was the
                // one that set cancel_signal (see process.rs).
                ResultMessage::Failure {
                    execution_id,
                    error_type: ErrorType::Cancelled,
                    error_message: "execution cancelled".to_string(),
                    duration_ms,
                }
            }
            SandboxOutcome::Failure(SandboxError::User(msg)) => ResultMessage::Failure {
                execution_id,
                error_type: ErrorType::UserError,
                error_message: msg,
                duration_ms,
            },
            SandboxOutcome::Failure(SandboxError::Runtime(msg)) => ResultMessage::Failure {
                execution_id,
                error_type: ErrorType::RuntimeError,
                error_message: msg,
                duration_ms,
            },
        }
    }
}

/// Builds the prepared [`ExecutionContext`] for a request, resolving scope
/// per §4.1. Separate from `Runner` so the Broker Consumer can call it
/// before routing, as the spec requires ("Build the prepared context...
/// and call Orchestrator.Route").
pub fn prepare_context(
    req: &ExecutionRequest,
    workflow_org: Option<&str>,
    cancel: CancellationHandle,
) -> ExecutionContext {
    ExecutionContext {
        execution_id: req.execution_id,
        scope: ExecutionContext::resolve_scope(workflow_org, req.caller_org_id.as_deref()),
        params: req.params.clone(),
        cancel,
    }
}
