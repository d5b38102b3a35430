//! In-memory `ExecutionStore`. Not a test double bolted on after the
//! fact — it satisfies the same trait the Postgres implementation does,
//! so integration-style tests exercise real component wiring.
//!
//! Grounded on the teacher's `persistence/memory.rs`
//! (`parking_lot::RwLock<HashMap<_>>`-backed internal state struct).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{
    BlacklistEntry, ExecutionResultRecord, StuckHistoryEntry, WorkflowId, WorkflowInfo,
};

use super::{ExecutionStore, LogEntry, StoreError};

#[derive(Default)]
struct State {
    workflows: HashMap<WorkflowId, WorkflowInfo>,
    terminals: HashMap<Uuid, ExecutionResultRecord>,
    logs: HashMap<Uuid, Vec<LogEntry>>,
    blacklist: HashMap<WorkflowId, BlacklistEntry>,
}

/// Reference implementation used by tests and by the service binary when
/// no `DATABASE_URL` is configured.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    state: RwLock<State>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/bootstrap helper: register a workflow definition directly,
    /// bypassing whatever out-of-scope process populates it in production.
    pub fn seed_workflow(&self, info: WorkflowInfo) {
        self.state
            .write()
            .workflows
            .insert(info.workflow_id.clone(), info);
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowInfo, StoreError> {
        self.state
            .read()
            .workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn write_execution_terminal(
        &self,
        record: ExecutionResultRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.terminals.contains_key(&record.execution_id) {
            return Err(StoreError::AlreadyFinalized);
        }
        state.terminals.insert(record.execution_id, record);
        Ok(())
    }

    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        entries: Vec<LogEntry>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let existing = state.logs.entry(execution_id).or_default();
        let seen: std::collections::HashSet<i64> =
            existing.iter().map(|e| e.sequence_number).collect();
        for entry in entries {
            if !seen.contains(&entry.sequence_number) {
                existing.push(entry);
            }
        }
        Ok(())
    }

    async fn get_blacklist_entry(
        &self,
        workflow_id: &str,
    ) -> Result<Option<BlacklistEntry>, StoreError> {
        Ok(self
            .state
            .read()
            .blacklist
            .get(workflow_id)
            .filter(|e| e.is_active())
            .cloned())
    }

    async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError> {
        Ok(self
            .state
            .read()
            .blacklist
            .values()
            .filter(|e| e.is_active())
            .cloned()
            .collect())
    }

    async fn upsert_blacklist_entry(&self, entry: BlacklistEntry) -> Result<(), StoreError> {
        self.state
            .write()
            .blacklist
            .insert(entry.workflow_id.clone(), entry);
        Ok(())
    }

    async fn mark_blacklist_removed(
        &self,
        workflow_id: &str,
        removed_by: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let entry = state
            .blacklist
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        entry.removed_at = Some(Utc::now());
        entry.removed_by = Some(removed_by.to_string());
        Ok(())
    }

    async fn stuck_history_aggregate(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StuckHistoryEntry>, StoreError> {
        let state = self.state.read();
        let mut counts: HashMap<WorkflowId, (u64, DateTime<Utc>)> = HashMap::new();
        for record in state.terminals.values() {
            if record.status != crate::model::TerminalStatus::Stuck || record.finished_at < since
            {
                continue;
            }
            let Some(workflow_id) = &record.workflow_id else {
                continue;
            };
            let slot = counts
                .entry(workflow_id.clone())
                .or_insert((0, record.finished_at));
            slot.0 += 1;
            if record.finished_at > slot.1 {
                slot.1 = record.finished_at;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(workflow_id, (count, last_at))| StuckHistoryEntry {
                workflow_id,
                count,
                last_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TerminalStatus;

    fn sample_record(status: TerminalStatus) -> ExecutionResultRecord {
        ExecutionResultRecord {
            execution_id: Uuid::now_v7(),
            workflow_id: Some("wf-1".to_string()),
            status,
            result_payload: None,
            error_type: None,
            error_message: None,
            duration_ms: 50,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn writes_exactly_one_terminal_per_execution() {
        let store = InMemoryExecutionStore::new();
        let record = sample_record(TerminalStatus::Success);
        store
            .write_execution_terminal(record.clone())
            .await
            .unwrap();
        let err = store
            .write_execution_terminal(record)
            .await
            .expect_err("second write for the same execution must fail");
        assert!(matches!(err, StoreError::AlreadyFinalized));
    }

    #[tokio::test]
    async fn blacklist_upsert_then_remove_then_get() {
        let store = InMemoryExecutionStore::new();
        let entry = BlacklistEntry::auto("wf-1".to_string(), 5, Utc::now());
        store.upsert_blacklist_entry(entry).await.unwrap();
        assert!(store
            .get_blacklist_entry("wf-1")
            .await
            .unwrap()
            .is_some());

        store
            .mark_blacklist_removed("wf-1", "admin-1")
            .await
            .unwrap();
        assert!(store
            .get_blacklist_entry("wf-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_blacklist_excludes_removed_entries() {
        let store = InMemoryExecutionStore::new();
        store
            .upsert_blacklist_entry(BlacklistEntry::auto("wf-1".to_string(), 5, Utc::now()))
            .await
            .unwrap();
        store
            .upsert_blacklist_entry(BlacklistEntry::auto("wf-2".to_string(), 5, Utc::now()))
            .await
            .unwrap();
        store.mark_blacklist_removed("wf-2", "admin-1").await.unwrap();

        let active = store.list_blacklist().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].workflow_id, "wf-1");
    }

    #[tokio::test]
    async fn append_execution_log_is_idempotent_by_sequence_number() {
        let store = InMemoryExecutionStore::new();
        let id = Uuid::now_v7();
        let entry = LogEntry {
            sequence_number: 1,
            message: "started".to_string(),
            recorded_at: Utc::now(),
        };
        store
            .append_execution_log(id, vec![entry.clone()])
            .await
            .unwrap();
        store.append_execution_log(id, vec![entry]).await.unwrap();
        assert_eq!(store.state.read().logs.get(&id).unwrap().len(), 1);
    }
}
