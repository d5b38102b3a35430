//! In-process `Sandbox` for embedding trusted workflow code (§4.1: "the
//! engine ships an in-process sandbox suitable for tests and for
//! embedding trusted workflow code"). Any other sandbox (subprocess,
//! WASM, language bridge) is a separate implementation of the same
//! `Sandbox` trait and is out of scope here.
//!
//! Grounded on `WorkflowRegistry`'s type-erased factory-map shape
//! (`HashMap<String, Factory>`, `register`/`create`), adapted from
//! constructing workflow instances to invoking boxed async handlers
//! keyed by `code_ref`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::runner::{ExecutionContext, Sandbox, SandboxError, SandboxOutcome};

type HandlerFuture = Pin<Box<dyn Future<Output = SandboxOutcome> + Send>>;

/// A registered unit of trusted, in-process workflow code.
pub type Handler = Arc<dyn Fn(&ExecutionContext) -> HandlerFuture + Send + Sync>;

/// Looks up a handler by `code_ref` and runs it. Registration is expected
/// at process startup, before the Orchestrator begins routing work;
/// `register` may still be called later (e.g. from tests) since the map
/// is behind a lock, but there is no hot-reload semantics beyond that.
#[derive(Default)]
pub struct InProcessSandbox {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl InProcessSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `code_ref`, overwriting any prior one.
    pub fn register<F, Fut>(&self, code_ref: impl Into<String>, handler: F)
    where
        F: Fn(&ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SandboxOutcome> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |ctx| Box::pin(handler(ctx)) as HandlerFuture);
        self.handlers.write().insert(code_ref.into(), boxed);
    }

    pub fn contains(&self, code_ref: &str) -> bool {
        self.handlers.read().contains_key(code_ref)
    }
}

#[async_trait]
impl Sandbox for InProcessSandbox {
    async fn execute(&self, ctx: &ExecutionContext) -> SandboxOutcome {
        if ctx.cancel.is_cancelled() {
            return SandboxOutcome::Failure(SandboxError::Cancelled);
        }

        let handler = self.handlers.read().get(code_ref_of(ctx)).cloned();

        match handler {
            Some(handler) => handler(ctx).await,
            None => SandboxOutcome::Failure(SandboxError::User(format!(
                "no handler registered for execution {}",
                ctx.execution_id
            ))),
        }
    }
}

/// `ExecutionContext` has no `code_ref` field (§4.1 lists only scope,
/// params, cancel); callers that need handler dispatch by code reference
/// pass it via `params.code_ref` instead, the same way `params` already
/// carries everything else JSON-shaped about the request.
fn code_ref_of(ctx: &ExecutionContext) -> &str {
    ctx.params
        .get("code_ref")
        .and_then(Value::as_str)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scope;
    use crate::runner::CancellationHandle;
    use uuid::Uuid;

    fn ctx(params: Value) -> ExecutionContext {
        ExecutionContext {
            execution_id: Uuid::now_v7(),
            scope: Scope::Global,
            params,
            cancel: CancellationHandle::new(),
        }
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_handler() {
        let sandbox = InProcessSandbox::new();
        sandbox.register("double", |ctx: &ExecutionContext| {
            let n = ctx.params.get("n").and_then(Value::as_i64).unwrap_or(0);
            async move { SandboxOutcome::Success(serde_json::json!({ "n": n * 2 })) }
        });

        let outcome = sandbox
            .execute(&ctx(serde_json::json!({"code_ref": "double", "n": 21})))
            .await;
        match outcome {
            SandboxOutcome::Success(payload) => assert_eq!(payload["n"], 42),
            SandboxOutcome::Failure(e) => panic!("expected success, got {e}"),
        }
    }

    #[tokio::test]
    async fn unknown_code_ref_is_a_user_error() {
        let sandbox = InProcessSandbox::new();
        let outcome = sandbox.execute(&ctx(serde_json::json!({"code_ref": "missing"}))).await;
        assert!(matches!(outcome, SandboxOutcome::Failure(SandboxError::User(_))));
    }

    #[tokio::test]
    async fn already_cancelled_context_short_circuits() {
        let sandbox = InProcessSandbox::new();
        sandbox.register("double", |_ctx: &ExecutionContext| async move {
            SandboxOutcome::Success(Value::Null)
        });
        let c = ctx(serde_json::json!({"code_ref": "double"}));
        c.cancel.cancel();
        let outcome = sandbox.execute(&c).await;
        assert!(matches!(outcome, SandboxOutcome::Failure(SandboxError::Cancelled)));
    }
}
