//! Storage capability traits consumed by the execution engine
//!
//! This module defines the two external capabilities the scheduler core
//! depends on but does not implement:
//!
//! - **[`RunStore`]** - run history, per-node execution records, and the
//!   workflow-scoped persistent key/value state that survives run
//!   boundaries
//! - **[`CredentialStore`]** - decrypted credential lookup for operator
//!   executors (the scheduler itself never touches credentials)
//!
//! Both traits are `async` and object-safe so backends can be swapped
//! without touching the engine: the in-memory reference implementations in
//! [`crate::memory`] serve development and tests, while production
//! deployments implement the same traits over their database of choice.
//!
//! # Durability boundary
//!
//! The engine snapshots **node outputs** (via [`RunStore::record_node_execution`])
//! and **persistent state** (via [`RunStore::save_persistent_state`]) at node
//! boundaries. The work queue and in-flight loop state are deliberately not
//! checkpointed; after a process restart a run replays from its entry nodes.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Workflow-scoped persistent key/value state.
pub type PersistentState = serde_json::Map<String, Value>;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is in progress
    Running,
    /// Run finished and every surfaced node completed
    Completed,
    /// Run was aborted by a node failure or cancellation
    Failed,
}

/// Terminal status of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    /// Node produced an output
    Completed,
    /// Node raised an error
    Failed,
}

/// One recorded node execution.
///
/// The engine emits one record per node dispatch, including repeated
/// executions of the same node inside a loop body (`attempt` counts those).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    /// Run this execution belongs to
    pub run_id: String,
    /// Node that executed
    pub node_id: String,
    /// Terminal status
    pub status: NodeRunStatus,
    /// Input the node was dispatched with
    pub input: Value,
    /// Output, when the node completed
    pub output: Option<Value>,
    /// Error message, when the node failed
    pub error: Option<String>,
    /// 1-based execution count of this node within the run
    pub attempt: u32,
    /// When the node started executing
    pub started_at: DateTime<Utc>,
    /// When the node finished
    pub finished_at: DateTime<Utc>,
}

/// A run row as stored by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id
    pub run_id: String,
    /// Workflow the run executed
    pub workflow_id: String,
    /// User the run executed on behalf of
    pub user_id: String,
    /// Current status
    pub status: RunStatus,
    /// Final per-node output map, set on completion
    pub result: Option<serde_json::Map<String, Value>>,
    /// Failure message, set when the run failed
    pub error: Option<String>,
    /// When the run row was created
    pub created_at: DateTime<Utc>,
    /// When the run reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

/// Persistence backend for run history and persistent state.
///
/// Implementations must be safe for concurrent access across runs and
/// serialize their own internal state; the engine calls these methods from
/// its single-threaded scheduler but multiple runs may share one backend.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create the run row and return its id.
    ///
    /// Called once before the first node executes so node records always
    /// reference an existing run.
    async fn create_run(&self, workflow_id: &str, user_id: &str) -> Result<String>;

    /// Record one node execution. Fire-and-forget from the engine's
    /// perspective: failures are logged, never fatal to the run.
    async fn record_node_execution(&self, record: NodeExecutionRecord) -> Result<()>;

    /// Mark the run completed with its final per-node output map.
    async fn mark_run_completed(
        &self,
        run_id: &str,
        result: serde_json::Map<String, Value>,
    ) -> Result<()>;

    /// Mark the run failed with a message.
    async fn mark_run_failed(&self, run_id: &str, error: &str) -> Result<()>;

    /// Load the workflow-scoped persistent state. Missing workflows load
    /// as an empty map.
    async fn load_persistent_state(&self, workflow_id: &str) -> Result<PersistentState>;

    /// Write the workflow-scoped persistent state. Called on every
    /// mutation (write-through), not only at run end.
    async fn save_persistent_state(
        &self,
        workflow_id: &str,
        state: PersistentState,
    ) -> Result<()>;
}

/// Decrypted credential lookup for operator executors.
///
/// The scheduler never consumes this capability itself; it is threaded to
/// executors that call external services. Envelope decryption happens
/// behind the trait.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up a decrypted credential map.
    ///
    /// Returns `Ok(None)` when no credential with that name exists for the
    /// user and service; `Err` only for backend failures.
    async fn get(
        &self,
        user_id: &str,
        service_type: &str,
        credential_name: &str,
    ) -> Result<Option<serde_json::Map<String, Value>>>;
}
