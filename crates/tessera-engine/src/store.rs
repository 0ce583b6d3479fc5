//! The execution persistence gateway.

use crate::execution::WorkflowExecution;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tessera_core::{TesseraError, TesseraResult};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Durable log of [`WorkflowExecution`] records.
///
/// The engine writes full records; no particular storage technology is
/// mandated.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persists a new execution record.
    async fn create(&self, execution: &WorkflowExecution) -> TesseraResult<()>;
    /// Overwrites an existing execution record.
    async fn update(&self, execution: &WorkflowExecution) -> TesseraResult<()>;
    /// Loads an execution record by id.
    async fn find(&self, id: Uuid) -> TesseraResult<Option<WorkflowExecution>>;
    /// Ids of all persisted executions.
    async fn list(&self) -> TesseraResult<Vec<Uuid>>;
}

/// In-memory store, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    records: RwLock<HashMap<Uuid, WorkflowExecution>>,
}

impl MemoryExecutionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create(&self, execution: &WorkflowExecution) -> TesseraResult<()> {
        self.records
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &WorkflowExecution) -> TesseraResult<()> {
        self.create(execution).await
    }

    async fn find(&self, id: Uuid) -> TesseraResult<Option<WorkflowExecution>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self) -> TesseraResult<Vec<Uuid>> {
        Ok(self.records.read().await.keys().copied().collect())
    }
}

/// File-based store (one JSON file per execution).
pub struct FileExecutionStore {
    dir: PathBuf,
}

impl FileExecutionStore {
    /// Creates the store, creating `dir` if needed.
    pub async fn new(dir: PathBuf) -> TesseraResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl ExecutionStore for FileExecutionStore {
    async fn create(&self, execution: &WorkflowExecution) -> TesseraResult<()> {
        let json = serde_json::to_string_pretty(execution)?;
        tokio::fs::write(self.record_path(execution.id), json).await?;
        Ok(())
    }

    async fn update(&self, execution: &WorkflowExecution) -> TesseraResult<()> {
        self.create(execution).await
    }

    async fn find(&self, id: Uuid) -> TesseraResult<Option<WorkflowExecution>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let execution: WorkflowExecution = serde_json::from_str(&data)
            .map_err(|e| TesseraError::State(format!("failed to parse execution record: {e}")))?;
        Ok(Some(execution))
    }

    async fn list(&self) -> TesseraResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::execution::ExecutionStatus;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryExecutionStore::new();
        let mut exec = WorkflowExecution::new("wf", json!({"prompt": "hi"}));
        store.create(&exec).await.unwrap();

        exec.transition(ExecutionStatus::Running).unwrap();
        store.update(&exec).await.unwrap();

        let found = store.find(exec.id).await.unwrap().unwrap();
        assert_eq!(found.status, ExecutionStatus::Running);
        assert_eq!(store.list().await.unwrap(), vec![exec.id]);
        assert!(store.find(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileExecutionStore::new(dir.path().to_path_buf())
            .await
            .unwrap();

        let exec = WorkflowExecution::new("wf", json!({"prompt": "hi"}));
        store.create(&exec).await.unwrap();

        let found = store.find(exec.id).await.unwrap().unwrap();
        assert_eq!(found.workflow_id, "wf");
        assert_eq!(found.input, json!({"prompt": "hi"}));

        let ids = store.list().await.unwrap();
        assert_eq!(ids, vec![exec.id]);
    }
}
