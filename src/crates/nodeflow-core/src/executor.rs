//! The operator capability: executors, their registry, and the execution
//! context
//!
//! Operator nodes (HTTP callers, transforms, logic, broker calls, ...)
//! live outside the scheduler core and plug in through the [`Executor`]
//! trait. The engine resolves a node's templated parameters, assembles
//! its input, and dispatches to the executor registered for the node's
//! `category`; the executor returns a payload or an
//! [`ExecutorError`](crate::error::ExecutorError).
//!
//! The [`ExecutionContext`] passed alongside exposes run identity, the
//! workflow-scoped persistent values (write-through), and a template
//! resolver for executors that resolve sub-templates lazily. Executors
//! are shared read-only across runs and must be side-effect safe: any
//! internal parallelism has to present its result atomically on resume.

use crate::error::{ExecutorError, Result};
use crate::graph::Node;
use crate::resolver::{ReferenceResolver, ResolveScope};
use async_trait::async_trait;
use nodeflow_runstore::{PersistentState, RunStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result of one executor dispatch.
pub type ExecResult = std::result::Result<Value, ExecutorError>;

/// A pluggable operator implementation.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The node category this executor serves.
    fn category(&self) -> &str;

    /// Execute `node` with its resolved parameters and assembled input.
    async fn execute(&self, node: &Node, input: Value, ctx: &ExecutionContext) -> ExecResult;
}

/// Maps node categories to executors.
///
/// Built once at startup, before any run begins, and shared read-only
/// across runs.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own category. Replaces any previous
    /// registration for the same category.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors
            .insert(executor.category().to_string(), executor);
    }

    /// Look up the executor for a category.
    pub fn get(&self, category: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(category).cloned()
    }

    /// Registered categories, unordered.
    pub fn categories(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }
}

/// Per-dispatch context handed to executors.
pub struct ExecutionContext {
    /// User the run executes on behalf of
    pub user_id: String,
    /// Workflow being executed
    pub workflow_id: String,
    /// Current run
    pub run_id: String,
    persistent: Arc<RwLock<PersistentState>>,
    run_store: Arc<dyn RunStore>,
    resolver: ReferenceResolver,
    outputs: HashMap<String, Value>,
    input: Option<Value>,
}

impl ExecutionContext {
    /// Build a context. The engine constructs one per dispatch; tests for
    /// executor implementations construct them directly.
    pub fn new(
        user_id: &str,
        workflow_id: &str,
        run_id: &str,
        persistent: Arc<RwLock<PersistentState>>,
        run_store: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            persistent,
            run_store,
            resolver: ReferenceResolver::new(),
            outputs: HashMap::new(),
            input: None,
        }
    }

    /// Attach the upstream-output snapshot used for lazy template
    /// resolution.
    pub fn with_outputs(mut self, outputs: HashMap<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Attach the current input snapshot used for lazy template
    /// resolution.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Read a workflow-scoped persistent value.
    pub async fn get_persistent_value(&self, key: &str) -> Option<Value> {
        self.persistent.read().await.get(key).cloned()
    }

    /// Write a workflow-scoped persistent value. The mutation is written
    /// through to the run store immediately.
    pub async fn set_persistent_value(&self, key: &str, value: Value) -> Result<()> {
        let snapshot = {
            let mut persistent = self.persistent.write().await;
            persistent.insert(key.to_string(), value);
            persistent.clone()
        };
        self.run_store
            .save_persistent_state(&self.workflow_id, snapshot)
            .await?;
        Ok(())
    }

    /// Resolve a template string against the dispatch's input and the
    /// upstream outputs.
    pub fn resolve_template(&self, template: &str) -> Value {
        self.resolver.resolve_string(
            template,
            ResolveScope {
                input: self.input.as_ref(),
                outputs: &self.outputs,
            },
        )
    }

    /// Deeply resolve a value the same way node parameters are resolved.
    pub fn resolve_value(&self, value: &Value) -> Value {
        self.resolver.resolve_value(
            value,
            ResolveScope {
                input: self.input.as_ref(),
                outputs: &self.outputs,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_runstore::InMemoryRunStore;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        fn category(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _node: &Node, input: Value, _ctx: &ExecutionContext) -> ExecResult {
            Ok(input)
        }
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Echo));

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.categories(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_persistent_values_write_through() {
        let run_store = Arc::new(InMemoryRunStore::new());
        let persistent = Arc::new(RwLock::new(PersistentState::new()));
        let ctx = ExecutionContext::new(
            "user-1",
            "wf-1",
            "run-1",
            Arc::clone(&persistent),
            run_store.clone(),
        );

        assert!(ctx.get_persistent_value("counter").await.is_none());
        ctx.set_persistent_value("counter", json!(1)).await.unwrap();
        assert_eq!(ctx.get_persistent_value("counter").await, Some(json!(1)));

        // Written through to the backing store
        let stored = run_store.load_persistent_state("wf-1").await.unwrap();
        assert_eq!(stored.get("counter"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_context_template_resolution() {
        let run_store = Arc::new(InMemoryRunStore::new());
        let persistent = Arc::new(RwLock::new(PersistentState::new()));
        let ctx = ExecutionContext::new("u", "wf", "run", persistent, run_store)
            .with_outputs(HashMap::from([("Prev".to_string(), json!({"x": 42}))]))
            .with_input(json!({"y": "hi"}));

        assert_eq!(ctx.resolve_template("{{ $('Prev').json.x }}"), json!(42));
        assert_eq!(ctx.resolve_template("{{ y }}"), json!("hi"));
    }
}
