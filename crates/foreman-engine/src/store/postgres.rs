//! PostgreSQL implementation of [`ExecutionStore`].
//!
//! Grounded on `PostgresWorkflowEventStore`'s style: a `PgPool`-holding
//! struct, `sqlx::query` (not the macro, to avoid a compile-time `DATABASE_URL`
//! requirement), `#[instrument]` on every method, and `StoreError::Database`
//! wrapping `sqlx::Error::to_string()`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::model::{
    BlacklistEntry, ErrorType, ExecutionResultRecord, StuckHistoryEntry, TerminalStatus,
    WorkflowInfo,
};

use super::{ExecutionStore, LogEntry, StoreError};

/// Connection-pooled Postgres store. Expects the `foreman_*` tables from
/// this crate's migrations (not included here: schema management is an
/// external collaborator, same as the teacher's `durable_*` tables).
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn terminal_status_str(status: TerminalStatus) -> &'static str {
    match status {
        TerminalStatus::Success => "success",
        TerminalStatus::Failed => "failed",
        TerminalStatus::Timeout => "timeout",
        TerminalStatus::Stuck => "stuck",
        TerminalStatus::Cancelled => "cancelled",
        TerminalStatus::Blocked => "blocked",
    }
}

fn parse_terminal_status(s: &str) -> Result<TerminalStatus, StoreError> {
    match s {
        "success" => Ok(TerminalStatus::Success),
        "failed" => Ok(TerminalStatus::Failed),
        "timeout" => Ok(TerminalStatus::Timeout),
        "stuck" => Ok(TerminalStatus::Stuck),
        "cancelled" => Ok(TerminalStatus::Cancelled),
        "blocked" => Ok(TerminalStatus::Blocked),
        other => Err(StoreError::Database(format!("unknown terminal status: {other}"))),
    }
}

fn error_type_str(e: &ErrorType) -> &'static str {
    match e {
        ErrorType::UserError => "user_error",
        ErrorType::RuntimeError => "runtime_error",
        ErrorType::Timeout => "timeout",
        ErrorType::Cancelled => "cancelled",
        ErrorType::WorkflowBlacklisted => "workflow_blacklisted",
        ErrorType::WorkerCrashed => "worker_crashed",
        ErrorType::ExecutionStuck => "execution_stuck",
    }
}

fn parse_error_type(s: &str) -> Result<ErrorType, StoreError> {
    match s {
        "user_error" => Ok(ErrorType::UserError),
        "runtime_error" => Ok(ErrorType::RuntimeError),
        "timeout" => Ok(ErrorType::Timeout),
        "cancelled" => Ok(ErrorType::Cancelled),
        "workflow_blacklisted" => Ok(ErrorType::WorkflowBlacklisted),
        "worker_crashed" => Ok(ErrorType::WorkerCrashed),
        "execution_stuck" => Ok(ErrorType::ExecutionStuck),
        other => Err(StoreError::Database(format!("unknown error type: {other}"))),
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self))]
    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, code_ref, organization_id, default_timeout_seconds
            FROM foreman_workflows
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(%e, "failed to load workflow");
            StoreError::Database(e.to_string())
        })?
        .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        Ok(WorkflowInfo {
            workflow_id: row.get("workflow_id"),
            code_ref: row.get("code_ref"),
            organization_id: row.get("organization_id"),
            default_timeout_seconds: row.get::<i64, _>("default_timeout_seconds") as u64,
        })
    }

    #[instrument(skip(self, record))]
    async fn write_execution_terminal(&self, record: ExecutionResultRecord) -> Result<(), StoreError> {
        let (error_type, error_message) = match (&record.error_type, &record.error_message) {
            (Some(t), msg) => (Some(error_type_str(t)), msg.clone()),
            (None, msg) => (None, msg.clone()),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO foreman_execution_results (
                execution_id, workflow_id, status, result_payload,
                error_type, error_message, duration_ms, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(record.execution_id)
        .bind(&record.workflow_id)
        .bind(terminal_status_str(record.status))
        .bind(&record.result_payload)
        .bind(error_type)
        .bind(error_message)
        .bind(record.duration_ms as i64)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(%e, "failed to write execution terminal record");
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyFinalized);
        }
        debug!(execution_id = %record.execution_id, "wrote terminal record");
        Ok(())
    }

    #[instrument(skip(self, entries))]
    async fn append_execution_log(&self, execution_id: Uuid, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO foreman_execution_logs (execution_id, sequence_number, message, recorded_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (execution_id, sequence_number) DO NOTHING
                "#,
            )
            .bind(execution_id)
            .bind(entry.sequence_number)
            .bind(&entry.message)
            .bind(entry.recorded_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(%e, "failed to append execution log entry");
                StoreError::Database(e.to_string())
            })?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_blacklist_entry(&self, workflow_id: &str) -> Result<Option<BlacklistEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, reason, blacklisted_at, blacklisted_by, stuck_count, removed_at, removed_by
            FROM foreman_blacklist
            WHERE workflow_id = $1 AND removed_at IS NULL
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(%e, "failed to load blacklist entry");
            StoreError::Database(e.to_string())
        })?;

        Ok(row.map(row_to_blacklist_entry))
    }

    #[instrument(skip(self))]
    async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, reason, blacklisted_at, blacklisted_by, stuck_count, removed_at, removed_by
            FROM foreman_blacklist
            WHERE removed_at IS NULL
            ORDER BY blacklisted_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(%e, "failed to list blacklist");
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.into_iter().map(row_to_blacklist_entry).collect())
    }

    #[instrument(skip(self, entry))]
    async fn upsert_blacklist_entry(&self, entry: BlacklistEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO foreman_blacklist (
                workflow_id, reason, blacklisted_at, blacklisted_by, stuck_count, removed_at, removed_by
            )
            VALUES ($1, $2, $3, $4, $5, NULL, NULL)
            ON CONFLICT (workflow_id) DO UPDATE SET
                reason = EXCLUDED.reason,
                blacklisted_at = EXCLUDED.blacklisted_at,
                blacklisted_by = EXCLUDED.blacklisted_by,
                stuck_count = EXCLUDED.stuck_count,
                removed_at = NULL,
                removed_by = NULL
            "#,
        )
        .bind(&entry.workflow_id)
        .bind(&entry.reason)
        .bind(entry.blacklisted_at)
        .bind(&entry.blacklisted_by)
        .bind(entry.stuck_count.map(|c| c as i32))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(%e, "failed to upsert blacklist entry");
            StoreError::Database(e.to_string())
        })?;

        debug!(workflow_id = %entry.workflow_id, "upserted blacklist entry");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_blacklist_removed(&self, workflow_id: &str, removed_by: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE foreman_blacklist
            SET removed_at = NOW(), removed_by = $2
            WHERE workflow_id = $1 AND removed_at IS NULL
            "#,
        )
        .bind(workflow_id)
        .bind(removed_by)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(%e, "failed to remove blacklist entry");
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stuck_history_aggregate(&self, since: DateTime<Utc>) -> Result<Vec<StuckHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, COUNT(*) AS count, MAX(finished_at) AS last_at
            FROM foreman_execution_results
            WHERE status = 'stuck' AND finished_at >= $1 AND workflow_id IS NOT NULL
            GROUP BY workflow_id
            ORDER BY count DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(%e, "failed to aggregate stuck history");
            StoreError::Database(e.to_string())
        })?;

        Ok(rows
            .into_iter()
            .map(|row| StuckHistoryEntry {
                workflow_id: row.get("workflow_id"),
                count: row.get::<i64, _>("count") as u64,
                last_at: row.get("last_at"),
            })
            .collect())
    }
}

fn row_to_blacklist_entry(row: sqlx::postgres::PgRow) -> BlacklistEntry {
    BlacklistEntry {
        workflow_id: row.get("workflow_id"),
        reason: row.get("reason"),
        blacklisted_at: row.get("blacklisted_at"),
        blacklisted_by: row.get("blacklisted_by"),
        stuck_count: row.get::<Option<i32>, _>("stuck_count").map(|c| c as u32),
        removed_at: row.get("removed_at"),
        removed_by: row.get("removed_by"),
    }
}

// `parse_terminal_status`/`parse_error_type` round-trip `terminal_status_str`/
// `error_type_str` for a future `load_execution_terminal` read path; unused
// for now since no operation in this engine reads a terminal record back.
#[allow(dead_code)]
fn _exhaustiveness_check(status: TerminalStatus, error: ErrorType) {
    let _ = parse_terminal_status(terminal_status_str(status));
    let _ = parse_error_type(error_type_str(&error));
}

#[cfg(test)]
mod tests {
    // Integration tests require a live PostgreSQL instance; run with
    // `DATABASE_URL=... cargo test -p foreman-engine --features postgres-integration`.
    // The in-memory store (`memory.rs`) carries the unit-level coverage of
    // the same `ExecutionStore` contract.
}
