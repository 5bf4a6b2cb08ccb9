//! In-memory storage backends for development and testing
//!
//! [`InMemoryRunStore`] and [`InMemoryCredentialStore`] are reference
//! implementations of the capability traits backed by
//! `Arc<tokio::sync::RwLock<HashMap>>`. All data is lost on process exit;
//! production deployments implement [`RunStore`] / [`CredentialStore`]
//! over a durable backend instead.
//!
//! Both types are `Clone` (handles share the same storage) and expose a
//! `clear()` for test isolation.

use crate::error::{Result, RunStoreError};
use crate::traits::{
    CredentialStore, NodeExecutionRecord, PersistentState, RunRecord, RunStatus, RunStore,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory [`RunStore`] implementation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<String, RunRecord>>>,
    node_executions: Arc<RwLock<HashMap<String, Vec<NodeExecutionRecord>>>>,
    persistent: Arc<RwLock<HashMap<String, PersistentState>>>,
}

impl InMemoryRunStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a run row by id.
    pub async fn run(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// Fetch the node execution records for a run, in recording order.
    pub async fn node_executions(&self, run_id: &str) -> Vec<NodeExecutionRecord> {
        self.node_executions
            .read()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of run rows being tracked.
    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Clear all state (useful for testing).
    pub async fn clear(&self) {
        self.runs.write().await.clear();
        self.node_executions.write().await.clear();
        self.persistent.write().await.clear();
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, workflow_id: &str, user_id: &str) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let record = RunRecord {
            run_id: run_id.clone(),
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            status: RunStatus::Running,
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.runs.write().await.insert(run_id.clone(), record);
        Ok(run_id)
    }

    async fn record_node_execution(&self, record: NodeExecutionRecord) -> Result<()> {
        self.node_executions
            .write()
            .await
            .entry(record.run_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn mark_run_completed(
        &self,
        run_id: &str,
        result: serde_json::Map<String, Value>,
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| RunStoreError::RunNotFound(run_id.to_string()))?;
        run.status = RunStatus::Completed;
        run.result = Some(result);
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_run_failed(&self, run_id: &str, error: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| RunStoreError::RunNotFound(run_id.to_string()))?;
        run.status = RunStatus::Failed;
        run.error = Some(error.to_string());
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn load_persistent_state(&self, workflow_id: &str) -> Result<PersistentState> {
        Ok(self
            .persistent
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_persistent_state(
        &self,
        workflow_id: &str,
        state: PersistentState,
    ) -> Result<()> {
        self.persistent
            .write()
            .await
            .insert(workflow_id.to_string(), state);
        Ok(())
    }
}

/// In-memory [`CredentialStore`] implementation.
///
/// Credentials are keyed by `(user_id, service_type, credential_name)` and
/// stored pre-decrypted; this backend exists for tests and local
/// development only.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialStore {
    credentials: Arc<RwLock<HashMap<(String, String, String), serde_json::Map<String, Value>>>>,
}

impl InMemoryCredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a credential map.
    pub async fn insert(
        &self,
        user_id: &str,
        service_type: &str,
        credential_name: &str,
        credential: serde_json::Map<String, Value>,
    ) {
        self.credentials.write().await.insert(
            (
                user_id.to_string(),
                service_type.to_string(),
                credential_name.to_string(),
            ),
            credential,
        );
    }

    /// Clear all credentials (useful for testing).
    pub async fn clear(&self) {
        self.credentials.write().await.clear();
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(
        &self,
        user_id: &str,
        service_type: &str,
        credential_name: &str,
    ) -> Result<Option<serde_json::Map<String, Value>>> {
        Ok(self
            .credentials
            .read()
            .await
            .get(&(
                user_id.to_string(),
                service_type.to_string(),
                credential_name.to_string(),
            ))
            .cloned())
    }
}
