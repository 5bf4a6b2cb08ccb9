//! # nodeflow-runstore - Storage capabilities for the nodeflow engine
//!
//! This crate defines the persistence seams the execution engine depends
//! on but never implements itself:
//!
//! - [`RunStore`] - run rows, per-node execution records, and the
//!   workflow-scoped persistent key/value state that survives runs
//! - [`CredentialStore`] - decrypted credential lookup for operator
//!   executors
//!
//! Reference in-memory backends ([`InMemoryRunStore`],
//! [`InMemoryCredentialStore`]) ship for development and tests. Production
//! deployments implement the same traits over a durable store; the engine
//! is generic over `Arc<dyn RunStore>` and notices no difference.
//!
//! ```rust
//! use nodeflow_runstore::{InMemoryRunStore, RunStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryRunStore::new();
//!     let run_id = store.create_run("wf-1", "user-1").await?;
//!     store.mark_run_completed(&run_id, Default::default()).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, RunStoreError};
pub use memory::{InMemoryCredentialStore, InMemoryRunStore};
pub use traits::{
    CredentialStore, NodeExecutionRecord, NodeRunStatus, PersistentState, RunRecord, RunStatus,
    RunStore,
};
