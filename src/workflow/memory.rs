/// In-process `WorkflowStore`
///
/// Keeps everything in a single `RwLock`-guarded state. Used for embedding
/// the engine without a database and throughout the test suite.

use crate::error::StoreError;
use crate::workflow::run::{LogEntry, Run, RunStatus, RunUpdate};
use crate::workflow::storage::{ScheduledWorkflow, WorkflowMetadata, WorkflowStore};
use crate::workflow::types::Workflow;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Same shape as SQLite's `CURRENT_TIMESTAMP`
const SQLITE_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default)]
struct MemoryState {
    workflows: BTreeMap<String, (Workflow, String)>,
    runs: Vec<Run>,
    logs: Vec<LogEntry>,
}

/// Memory-backed store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    /// When set, every call fails with `StoreError::Unavailable`
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage of the backing store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let version = state
            .workflows
            .get(&workflow.id)
            .map(|(existing, _)| existing.version + 1)
            .unwrap_or(1);

        let mut stored = workflow.clone();
        stored.version = version;
        state
            .workflows
            .insert(workflow.id.clone(), (stored.clone(), Utc::now().format(SQLITE_TIMESTAMP).to_string()));
        Ok(stored)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state.workflows.get(id).map(|(wf, _)| wf.clone()))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowMetadata>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut workflows: Vec<WorkflowMetadata> = state
            .workflows
            .values()
            .map(|(wf, updated_at)| WorkflowMetadata {
                id: wf.id.clone(),
                name: wf.name.clone(),
                status: wf.status,
                version: wf.version,
                updated_at: updated_at.clone(),
            })
            .collect();
        // Most recently saved first, like the SQLite store
        workflows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(workflows)
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        Ok(state.workflows.remove(id).is_some())
    }

    async fn list_active_scheduled_workflows(&self) -> Result<Vec<ScheduledWorkflow>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .workflows
            .values()
            .filter_map(|(wf, _)| ScheduledWorkflow::from_workflow(wf.clone()))
            .collect())
    }

    async fn count_runs(&self, workflow_id: &str) -> Result<u64, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .filter(|run| run.workflow_id == workflow_id)
            .count() as u64)
    }

    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().await.runs.push(run.clone());
        Ok(())
    }

    async fn update_run(&self, id: &str, update: &RunUpdate) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let run = state
            .runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        // Terminal runs are frozen
        if !run.status.is_terminal() {
            run.apply(update);
        }
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state.runs.iter().find(|run| run.id == id).cloned())
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<Run>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|run| run.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().await.logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, run_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut logs: Vec<LogEntry> = state
            .logs
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        logs.sort_by_key(|entry| entry.timestamp);
        Ok(logs)
    }

    async fn fail_stale_runs(&self, message: &str) -> Result<u64, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let mut touched = 0;
        for run in state.runs.iter_mut().filter(|run| !run.status.is_terminal()) {
            run.apply(&RunUpdate::finished(
                RunStatus::Failed,
                Some(message.to_string()),
            ));
            touched += 1;
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::WorkflowStatus;
    use serde_json::json;

    #[tokio::test]
    async fn unavailable_store_rejects_calls() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.count_runs("wf").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert_eq!(store.count_runs("wf").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn terminal_runs_are_frozen() {
        let store = MemoryStore::new();
        let run = Run::new("wf", 1, "bob", json!({}), 1);
        store.create_run(&run).await.unwrap();
        store
            .update_run(&run.id, &RunUpdate::finished(RunStatus::Failed, Some("boom".into())))
            .await
            .unwrap();
        let failed = store.get_run(&run.id).await.unwrap().unwrap();

        store
            .update_run(&run.id, &RunUpdate::finished(RunStatus::Cancelled, None))
            .await
            .unwrap();
        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.completed_at, failed.completed_at);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));

        assert!(matches!(
            store.update_run("missing", &RunUpdate::status(RunStatus::Running)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn workflows_list_most_recent_first() {
        let store = MemoryStore::new();
        for id in ["b", "a", "c"] {
            let wf = Workflow {
                id: id.to_string(),
                name: id.to_string(),
                status: WorkflowStatus::Active,
                version: 0,
                nodes: vec![],
                edges: vec![],
            };
            store.save_workflow(&wf).await.unwrap();
        }
        {
            // Back-date "c" so it sorts last
            let mut state = store.state.write().await;
            if let Some((_, updated_at)) = state.workflows.get_mut("c") {
                *updated_at = "2000-01-01 00:00:00".to_string();
            }
        }

        let ids: Vec<String> = store
            .list_workflows()
            .await
            .unwrap()
            .into_iter()
            .map(|wf| wf.id)
            .collect();
        // a was saved after b, or in the same second and wins the id tie-break
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn versions_increase_per_save() {
        let store = MemoryStore::new();
        let wf = Workflow {
            id: "wf".to_string(),
            name: "wf".to_string(),
            status: WorkflowStatus::Active,
            version: 42,
            nodes: vec![],
            edges: vec![],
        };
        assert_eq!(store.save_workflow(&wf).await.unwrap().version, 1);
        assert_eq!(store.save_workflow(&wf).await.unwrap().version, 2);

        let run = Run::new("wf", 2, "bob", json!({}), 0);
        store.create_run(&run).await.unwrap();
        assert_eq!(store.list_runs("wf").await.unwrap().len(), 1);
    }
}
