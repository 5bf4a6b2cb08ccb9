//! # nodeflow-core - Branch-aware workflow execution engine
//!
//! The core of a visual, node-based automation platform: a single-queue
//! scheduler that drives a directed graph of heterogeneous operator nodes
//! (HTTP callers, conditionals, switches, loops, transforms), routes
//! payloads along result-selected edges, and implements a tick / feedback
//! / drain protocol that lets a loop's body contain a cyclic subgraph
//! whose outputs feed back into the loop for aggregation.
//!
//! ## Components
//!
//! - [`Engine`] - the main loop: dequeue → resolve → execute → route →
//!   enqueue, plus run bookkeeping and cooperative cancellation
//! - [`QueueManager`] - strict FIFO of work items with per-iteration
//!   refcounts and drain signals
//! - [`NodeRouter`] - edge selection from node results and
//!   `sourceHandle` labels
//! - [`NodeStore`] - per-run state: outputs, loop state, edge buffers,
//!   errors, and the workflow-scoped persistent map
//! - [`LoopController`] - batch slicing, body dispatch, drain handling,
//!   aggregation, throttling
//! - [`ReferenceResolver`] - `{{ $('Node').json.path }}` template
//!   substitution against upstream outputs
//! - [`Executor`] / [`ExecutorRegistry`] - the operator capability the
//!   core consumes but never implements
//!
//! ## Concurrency model
//!
//! The scheduler is a single-threaded cooperative loop: all queue, store,
//! and loop-state mutations happen on one thread of control, and
//! suspension occurs only at awaited I/O inside executors, run-store
//! passthroughs, and loop throttle sleeps. Payloads are untyped
//! [`serde_json::Value`]s; executors declare their own shapes.
//!
//! ## Example
//!
//! ```rust,ignore
//! use nodeflow_core::{Engine, ExecutorRegistry, Workflow};
//! use nodeflow_runstore::InMemoryRunStore;
//! use std::sync::Arc;
//!
//! let workflow: Workflow = serde_json::from_str(graph_json)?;
//! let mut registry = ExecutorRegistry::new();
//! registry.register(Arc::new(MyExecutor));
//!
//! let engine = Engine::new(workflow, Arc::new(registry), Arc::new(InMemoryRunStore::new()))?;
//! let outcome = engine.run(Some(serde_json::json!({"items": [1, 2, 3]}))).await;
//! assert!(outcome.success);
//! ```

pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod loops;
pub mod queue;
pub mod resolver;
pub mod router;
pub mod store;

pub use engine::{CancelToken, Engine, EngineConfig, RunResult};
pub use error::{EngineError, ExecutorError, Result};
pub use executor::{ExecResult, ExecutionContext, Executor, ExecutorRegistry};
pub use graph::{
    Edge, EdgeId, Node, NodeId, Workflow, HANDLE_DEFAULT, HANDLE_DONE, HANDLE_FALSE, HANDLE_LOOP,
    HANDLE_TRUE, TYPE_IF, TYPE_LOOP, TYPE_SWITCH,
};
pub use loops::{error_record, is_error_record, LoopController, ERROR_KEY, LOOP_CONTEXT_KEY};
pub use queue::{DrainSignal, IterationKey, QueueManager, WorkItem, WorkMeta};
pub use resolver::{ReferenceResolver, ResolveScope};
pub use router::NodeRouter;
pub use store::{LoopConfig, LoopState, NodeErrorRecord, NodeState, NodeStore};
