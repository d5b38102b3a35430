//! Persistence store interface (§6): the abstract operations the engine
//! consumes from the persistence layer, plus an in-memory and a
//! PostgreSQL-backed implementation.
//!
//! Grounded on the teacher's `WorkflowEventStore` trait shape and
//! `StoreError` enum.

mod memory;
mod postgres;

pub use memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    BlacklistEntry, ExecutionResultRecord, StuckHistoryEntry, WorkflowId, WorkflowInfo,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("execution not found: {0}")]
    ExecutionNotFound(uuid::Uuid),

    #[error("a terminal record already exists for this execution")]
    AlreadyFinalized,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One idempotent log entry appended for an execution, keyed by sequence
/// number so retries of the same append are no-ops.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub sequence_number: i64,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// The Store interface (§6). The engine never mutates persisted records
/// outside the Consumer's terminal-record writes and the admin surface's
/// blacklist mutations (§5).
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowInfo, StoreError>;

    /// Atomic; failure is retryable. Exactly one terminal record is
    /// written per `execution_id` (§3 invariant, §8 property 1).
    async fn write_execution_terminal(
        &self,
        record: ExecutionResultRecord,
    ) -> Result<(), StoreError>;

    /// Idempotent by `(execution_id, sequence_number)`.
    async fn append_execution_log(
        &self,
        execution_id: uuid::Uuid,
        entries: Vec<LogEntry>,
    ) -> Result<(), StoreError>;

    async fn get_blacklist_entry(
        &self,
        workflow_id: &str,
    ) -> Result<Option<BlacklistEntry>, StoreError>;

    /// All currently-active (non-removed) blacklist entries (§4.7: "list
    /// blacklist").
    async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError>;

    async fn upsert_blacklist_entry(&self, entry: BlacklistEntry) -> Result<(), StoreError>;

    async fn mark_blacklist_removed(
        &self,
        workflow_id: &str,
        removed_by: &str,
    ) -> Result<(), StoreError>;

    async fn stuck_history_aggregate(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StuckHistoryEntry>, StoreError>;
}
