//! Core data types shared across the engine: requests, results, records,
//! and the engine-wide error taxonomy.
//!
//! Grounded on the serde-tagged-enum style of `WorkflowAction` and the
//! `thiserror` enum shape of `StoreError` in the teacher crate this engine
//! was adapted from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque execution identity, unique across all requests ever accepted.
pub type ExecutionId = Uuid;

/// Stable identity of a workflow definition.
pub type WorkflowId = String;

/// Tenant scope under which capability calls resolve data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    Organization { org_id: String },
    Global,
}

/// The payload the Broker Consumer receives off the broker.
///
/// Immutable after enqueue; `execution_id` is unique across all requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub execution_id: ExecutionId,
    pub workflow_id: Option<WorkflowId>,
    pub organization_id: Option<String>,
    pub caller_org_id: Option<String>,
    pub code_ref: String,
    pub params: serde_json::Value,
    pub timeout_seconds: u64,
    pub is_script: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl ExecutionRequest {
    /// Timeout exactly 0 is rejected at admission (§8 boundary behaviour).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.timeout_seconds == 0 {
            return Err(EngineError::UserError(
                "timeout_seconds must be >= 1".to_string(),
            ));
        }
        if self.workflow_id.is_none() && !self.is_script {
            return Err(EngineError::UserError(
                "workflow_id is required for non-script executions".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metadata about a workflow definition as returned by `LoadWorkflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub workflow_id: WorkflowId,
    pub code_ref: String,
    pub organization_id: Option<String>,
    pub default_timeout_seconds: u64,
}

/// Status of an Execution Handle inside a Worker Process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Cancelling,
    Stuck,
    Done,
}

/// State of a Worker Process as tracked by the Orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Active,
    Draining,
    PendingKill,
    Exiting,
}

/// Terminal classification of an execution, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Success,
    Failed,
    Timeout,
    Stuck,
    Cancelled,
    Blocked,
}

/// Classification of why an execution failed, mirrors §7's error kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    UserError,
    RuntimeError,
    Timeout,
    Cancelled,
    WorkflowBlacklisted,
    WorkerCrashed,
    ExecutionStuck,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserError => "UserError",
            Self::RuntimeError => "RuntimeError",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::WorkflowBlacklisted => "WorkflowBlacklisted",
            Self::WorkerCrashed => "WorkerCrashed",
            Self::ExecutionStuck => "ExecutionStuck",
        };
        write!(f, "{s}")
    }
}

/// The message a Runner (or, for `Stuck`, the Worker Process) emits for one
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultMessage {
    Success {
        execution_id: ExecutionId,
        payload: serde_json::Value,
        duration_ms: u64,
    },
    Failure {
        execution_id: ExecutionId,
        error_type: ErrorType,
        error_message: String,
        duration_ms: u64,
    },
    Stuck {
        execution_id: ExecutionId,
        elapsed_ms: u64,
    },
}

impl ResultMessage {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            Self::Success { execution_id, .. }
            | Self::Failure { execution_id, .. }
            | Self::Stuck { execution_id, .. } => *execution_id,
        }
    }

    /// Maps a ResultMessage to a terminal status per §4.4's finalization
    /// rules. `Blocked` is never produced here; it is written only by the
    /// Consumer itself at admission time.
    pub fn terminal_status(&self) -> TerminalStatus {
        match self {
            Self::Success { .. } => TerminalStatus::Success,
            Self::Stuck { .. } => TerminalStatus::Stuck,
            Self::Failure { error_type, .. } => match error_type {
                ErrorType::Timeout => TerminalStatus::Timeout,
                ErrorType::Cancelled => TerminalStatus::Cancelled,
                _ => TerminalStatus::Failed,
            },
        }
    }
}

/// Persisted, one per execution, immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResultRecord {
    pub execution_id: ExecutionId,
    /// Not one of §3's "essential attributes" but required to join back to
    /// a workflow for `StuckHistoryAggregate`; `None` for scripts.
    pub workflow_id: Option<WorkflowId>,
    pub status: TerminalStatus,
    pub result_payload: Option<serde_json::Value>,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// TTL-bound entry in the key-value store representing a worker's online
/// presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
}

/// Persisted quarantine record. Only one active (non-removed) entry per
/// `workflow_id` at a time; removed entries are retained as audit history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub workflow_id: WorkflowId,
    pub reason: String,
    pub blacklisted_at: DateTime<Utc>,
    pub blacklisted_by: Option<String>,
    pub stuck_count: Option<u32>,
    pub removed_at: Option<DateTime<Utc>>,
    pub removed_by: Option<String>,
}

impl BlacklistEntry {
    pub fn auto(workflow_id: WorkflowId, stuck_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id,
            reason: format!("auto:stuck:{stuck_count}"),
            blacklisted_at: now,
            blacklisted_by: None,
            stuck_count: Some(stuck_count),
            removed_at: None,
            removed_by: None,
        }
    }

    pub fn manual(workflow_id: WorkflowId, note: String, by: String, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id,
            reason: format!("manual:{note}"),
            blacklisted_at: now,
            blacklisted_by: Some(by),
            stuck_count: None,
            removed_at: None,
            removed_by: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

/// A row of `StuckHistoryAggregate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckHistoryEntry {
    pub workflow_id: WorkflowId,
    pub count: u64,
    pub last_at: DateTime<Utc>,
}

/// One snapshot of a Worker Process's execution for heartbeat/admin display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: Option<WorkflowId>,
    pub elapsed_ms: u64,
    pub status: ExecutionStatus,
}

/// The periodic snapshot a Worker Process emits, and the Registry publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub worker_id: String,
    pub pid: u32,
    pub state: ProcessState,
    pub uptime_ms: u64,
    pub executions_completed: u64,
    pub current_executions: Vec<CurrentExecutionSnapshot>,
    /// Resident memory of this process, sampled at heartbeat time.
    /// `None` if the host platform doesn't expose it.
    pub memory_bytes: Option<u64>,
}

/// Telemetry channel message types (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    WorkerOnline {
        worker_id: String,
    },
    WorkerOffline {
        worker_id: String,
    },
    WorkerHeartbeat {
        snapshot: HeartbeatSnapshot,
    },
    ExecutionStuck {
        execution_id: ExecutionId,
        workflow_id: Option<WorkflowId>,
    },
    ProcessStateChanged {
        worker_id: String,
        pid: u32,
        new_state: ProcessState,
        reason: String,
    },
}

/// Engine-wide error taxonomy (§7): eight kinds, one enum, so `?` composes
/// across component boundaries without manual mapping at every call site.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("user error: {0}")]
    UserError(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("execution timed out")]
    Timeout,

    #[error("execution stuck after grace period")]
    Stuck,

    #[error("execution cancelled")]
    Cancelled,

    #[error("workflow {0} is blacklisted")]
    Blocked(WorkflowId),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("worker process crashed: {0}")]
    Orchestration(String),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Kv(#[from] crate::kv::KvError),
}
