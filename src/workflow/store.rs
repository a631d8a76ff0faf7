use crate::workflow::types::{StageRecord, WorkflowExecution, WorkflowStatus};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Durable storage for executions, supporting partial per-stage updates so
/// progress survives a crash mid-pipeline.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    async fn create(&self, execution: WorkflowExecution) -> Result<()>;
    async fn load(&self, execution_id: &str) -> Result<Option<WorkflowExecution>>;
    async fn record_stage(&self, execution_id: &str, record: StageRecord) -> Result<()>;
    async fn finish(&self, execution_id: &str, status: WorkflowStatus) -> Result<()>;
}

/// In-memory store. Production deployments put a database behind the trait;
/// the pipeline only ever needs these four operations.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    inner: Mutex<HashMap<String, WorkflowExecution>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn create(&self, execution: WorkflowExecution) -> Result<()> {
        let mut map = self.inner.lock().await;
        map.insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<WorkflowExecution>> {
        let map = self.inner.lock().await;
        Ok(map.get(execution_id).cloned())
    }

    async fn record_stage(&self, execution_id: &str, record: StageRecord) -> Result<()> {
        let mut map = self.inner.lock().await;
        match map.get_mut(execution_id) {
            Some(exec) => {
                exec.stage_results.insert(record.stage, record);
                Ok(())
            }
            None => bail!("unknown execution '{execution_id}'"),
        }
    }

    async fn finish(&self, execution_id: &str, status: WorkflowStatus) -> Result<()> {
        let mut map = self.inner.lock().await;
        match map.get_mut(execution_id) {
            Some(exec) => {
                exec.status = status;
                exec.finished_at = Some(Utc::now());
                Ok(())
            }
            None => bail!("unknown execution '{execution_id}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Hints;
    use crate::workflow::types::Stage;

    #[tokio::test]
    async fn stage_updates_are_partial() {
        let store = MemoryWorkflowStore::new();
        let exec = WorkflowExecution::new("e1".to_string(), "img".to_string(), Hints::default());
        store.create(exec).await.unwrap();

        store
            .record_stage(
                "e1",
                StageRecord::succeeded(Stage::Extracting, "done", &serde_json::json!({})),
            )
            .await
            .unwrap();
        store
            .record_stage("e1", StageRecord::failed(Stage::Pricing, "timeout"))
            .await
            .unwrap();

        let loaded = store.load("e1").await.unwrap().unwrap();
        assert_eq!(loaded.stage_results.len(), 2);
        assert!(loaded.stage_results[&Stage::Extracting].ok);
        assert!(!loaded.stage_results[&Stage::Pricing].ok);
        assert_eq!(loaded.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn finish_stamps_status_and_time() {
        let store = MemoryWorkflowStore::new();
        let exec = WorkflowExecution::new("e2".to_string(), "img".to_string(), Hints::default());
        store.create(exec).await.unwrap();
        store.finish("e2", WorkflowStatus::Partial).await.unwrap();

        let loaded = store.load("e2").await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Partial);
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn unknown_execution_errors() {
        let store = MemoryWorkflowStore::new();
        assert!(store.finish("nope", WorkflowStatus::Failed).await.is_err());
    }
}
