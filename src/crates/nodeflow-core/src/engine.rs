//! The engine main loop
//!
//! [`Engine`] drives one workflow run over a single FIFO queue: it seeds
//! the queue with the graph's entry nodes, then repeatedly dequeues one
//! work item, resolves the node's templated parameters, assembles its
//! input, dispatches the registered executor (or the loop controller for
//! `Loop` nodes), records the result, and routes the output along the
//! edges the router selects. Successors are enqueued in edge declaration
//! order - except edges targeting an active loop, whose payloads are
//! buffered on the loop's edge slots instead (the feedback discipline).
//!
//! Everything mutable lives on the engine's single thread of control;
//! suspension happens only inside executors, run-store passthroughs, and
//! loop throttle sleeps. Cancellation is cooperative and checked between
//! ticks.

use crate::error::{EngineError, Result};
use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::graph::{Edge, Node, Workflow, TYPE_LOOP};
use crate::loops::{error_record, LoopController};
use crate::queue::{QueueManager, WorkItem, WorkMeta};
use crate::resolver::{ReferenceResolver, ResolveScope};
use crate::router::NodeRouter;
use crate::store::{NodeState, NodeStore};
use chrono::{DateTime, Utc};
use nodeflow_runstore::{NodeExecutionRecord, NodeRunStatus, RunStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Cooperative cancellation flag, checked between ticks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The engine notices before its next dequeue.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on dequeues per run; a cyclic graph that never settles
    /// fails instead of spinning forever.
    pub max_ticks: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_ticks: 100_000 }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Whether the run completed without a surfaced failure
    pub success: bool,
    /// Final output per node id, present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Map<String, Value>>,
    /// Failure message, present on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    fn completed(result: serde_json::Map<String, Value>) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Single-run workflow execution engine.
///
/// The engine exclusively owns its queue, store, router, and loop
/// controller for the duration of a run; the executor registry and the
/// run store are shared by reference across runs.
pub struct Engine {
    workflow: Workflow,
    registry: Arc<ExecutorRegistry>,
    run_store: Arc<dyn RunStore>,
    config: EngineConfig,
    cancel: CancelToken,
    user_id: String,
}

impl Engine {
    /// Build an engine for `workflow`. Validates the graph structure.
    pub fn new(
        mut workflow: Workflow,
        registry: Arc<ExecutorRegistry>,
        run_store: Arc<dyn RunStore>,
    ) -> Result<Self> {
        workflow.validate()?;
        if workflow.id.is_empty() {
            workflow.id = uuid::Uuid::new_v4().to_string();
        }
        Ok(Self {
            workflow,
            registry,
            run_store,
            config: EngineConfig::default(),
            cancel: CancelToken::new(),
            user_id: "default".to_string(),
        })
    }

    /// Set the user the run executes on behalf of.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Override the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The workflow id this engine runs.
    pub fn workflow_id(&self) -> &str {
        &self.workflow.id
    }

    /// A clonable handle for cooperative cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Execute the workflow once with an optional trigger input.
    pub async fn run(&self, input: Option<Value>) -> RunResult {
        let run_id = match self
            .run_store
            .create_run(&self.workflow.id, &self.user_id)
            .await
        {
            Ok(id) => id,
            Err(err) => return RunResult::failed(format!("failed to create run: {err}")),
        };
        info!(run_id = %run_id, workflow_id = %self.workflow.id, "run started");

        match self.run_inner(&run_id, input).await {
            Ok(result) => {
                if let Err(err) = self
                    .run_store
                    .mark_run_completed(&run_id, result.clone())
                    .await
                {
                    warn!(run_id = %run_id, error = %err, "failed to mark run completed");
                }
                info!(run_id = %run_id, "run completed");
                RunResult::completed(result)
            }
            Err(err) => {
                let message = err.to_string();
                error!(run_id = %run_id, error = %message, "run failed");
                if let Err(err) = self.run_store.mark_run_failed(&run_id, &message).await {
                    warn!(run_id = %run_id, error = %err, "failed to mark run failed");
                }
                RunResult::failed(message)
            }
        }
    }

    async fn run_inner(
        &self,
        run_id: &str,
        input: Option<Value>,
    ) -> Result<serde_json::Map<String, Value>> {
        let mut store = NodeStore::new(&self.workflow, self.run_store.clone(), &self.workflow.id);
        if let Err(err) = store.load_persistent().await {
            warn!(error = %err, "persistent state unavailable; starting empty");
        }
        let router = NodeRouter::new(&self.workflow);
        let resolver = ReferenceResolver::new();
        let loops = LoopController::new();
        let mut queue = QueueManager::new();
        let mut attempts: HashMap<String, u32> = HashMap::new();

        for node in self.workflow.entry_nodes() {
            let mut item = WorkItem::new(node.id.clone());
            if let Some(input) = &input {
                item = item.with_input(input.clone());
            }
            queue.enqueue(item);
        }

        let mut ticks: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                queue.clear();
                return Err(EngineError::Cancelled);
            }
            let Some(item) = queue.dequeue() else {
                break;
            };
            ticks += 1;
            if ticks > self.config.max_ticks {
                queue.clear();
                return Err(EngineError::TickLimitExceeded(self.config.max_ticks));
            }

            let Some(def) = store.node_def(&item.node_id).cloned() else {
                warn!(node = %item.node_id, "skipping work item for unknown node");
                continue;
            };

            // Hold the iteration scope open for the whole execution: the
            // engine's own count on top of the enqueue-time count.
            let scope = item.meta.scope();
            if let Some((loop_id, iter)) = &scope {
                queue.inc(loop_id, *iter);
            }

            store.set_node_state(&def.id, NodeState::Running);
            let attempt = {
                let counter = attempts.entry(def.id.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            let started_at = Utc::now();

            let outcome = if def.node_type == TYPE_LOOP {
                store.end_activation(&def.id);
                loops
                    .tick(&def.id, item.input.as_ref(), &mut store, &mut queue, &router)
                    .await
            } else {
                self.execute_node(
                    &def, &item, attempt, started_at, run_id, &resolver, &mut store, &mut queue,
                    &router,
                )
                .await
            };

            // Release both counts only after every successor enqueue; the
            // last release may drain the iteration.
            if let Some((loop_id, iter)) = &scope {
                for _ in 0..2 {
                    if let Some(signal) = queue.dec(loop_id, *iter) {
                        loops
                            .handle_drain(
                                &signal.loop_id,
                                signal.iter_index,
                                &mut store,
                                &mut queue,
                                &router,
                            )
                            .await?;
                    }
                }
            }

            outcome?;
        }

        Ok(store.outputs_map())
    }

    /// Execute one non-loop node and route its result.
    #[allow(clippy::too_many_arguments)]
    async fn execute_node(
        &self,
        def: &Node,
        item: &WorkItem,
        attempt: u32,
        started_at: DateTime<Utc>,
        run_id: &str,
        resolver: &ReferenceResolver,
        store: &mut NodeStore,
        queue: &mut QueueManager,
        router: &NodeRouter,
    ) -> Result<()> {
        let outputs = store.outputs_by_name();
        let resolved_values = resolver.resolve_params(
            &def.values,
            ResolveScope {
                input: item.input.as_ref(),
                outputs: &outputs,
            },
        );
        let mut resolved_def = def.clone();
        resolved_def.values = resolved_values.clone();
        let input_value = assemble_input(&resolved_values, item, def, &self.workflow, store);

        let Some(executor) = self.registry.get(&def.category) else {
            store.set_node_state(&def.id, NodeState::Failed);
            store.set_node_error(
                &def.id,
                format!("no executor for category '{}'", def.category),
            );
            return Err(EngineError::unsupported_category(&def.id, &def.category));
        };

        let mut ctx = ExecutionContext::new(
            &self.user_id,
            &self.workflow.id,
            run_id,
            store.persistent_handle(),
            self.run_store.clone(),
        )
        .with_outputs(outputs);
        if !input_value.is_null() {
            ctx = ctx.with_input(input_value.clone());
        }

        debug!(node = %def.id, attempt, "executing node");
        match executor.execute(&resolved_def, input_value.clone(), &ctx).await {
            Ok(output) => {
                store.set_node_output(&def.id, output.clone());
                store.set_node_state(&def.id, NodeState::Completed);
                store
                    .record_node_execution(NodeExecutionRecord {
                        run_id: run_id.to_string(),
                        node_id: def.id.clone(),
                        status: NodeRunStatus::Completed,
                        input: input_value,
                        output: Some(output.clone()),
                        error: None,
                        attempt,
                        started_at,
                        finished_at: Utc::now(),
                    })
                    .await;

                for edge in router.select(def, &output) {
                    let payload = payload_for_edge(def, &output, edge);
                    route_edge(store, queue, edge, payload, &item.meta);
                }
                Ok(())
            }
            Err(exec_err) => {
                let err = EngineError::from_executor(&def.id, exec_err);
                let message = err.to_string();
                store.set_node_state(&def.id, NodeState::Failed);
                store.set_node_error(&def.id, message.clone());
                store
                    .record_node_execution(NodeExecutionRecord {
                        run_id: run_id.to_string(),
                        node_id: def.id.clone(),
                        status: NodeRunStatus::Failed,
                        input: input_value,
                        output: None,
                        error: Some(message.clone()),
                        attempt,
                        started_at,
                        finished_at: Utc::now(),
                    })
                    .await;

                match &item.meta.origin_loop_id {
                    Some(origin) => {
                        // Inside a loop body the failure travels the
                        // feedback channel; the drain decides its fate.
                        let record = error_record(&def.id, &message);
                        let edge_id = router
                            .outgoing(&def.id)
                            .iter()
                            .find(|e| e.target == *origin)
                            .map(|e| e.id.clone())
                            .unwrap_or_else(|| format!("$error:{}", def.id));
                        store.buffer_to_loop(origin, &edge_id, record);
                        warn!(node = %def.id, loop_id = %origin, "node failed in loop body; error buffered");
                        Ok(())
                    }
                    None => Err(err),
                }
            }
        }
    }
}

/// Route one payload along an edge: enqueue the target, or buffer the
/// payload when the target is a loop mid-cycle. Returns whether a work
/// item was enqueued.
///
/// A loop with no unfinished state is a cold entry: the payload rides an
/// activation work item so mid-graph loops start at all. One activation
/// may be in flight per loop; concurrent cold arrivals are dropped with a
/// warning.
pub(crate) fn route_edge(
    store: &mut NodeStore,
    queue: &mut QueueManager,
    edge: &Edge,
    payload: Value,
    meta: &WorkMeta,
) -> bool {
    let (is_loop, disabled) = match store.node_def(&edge.target) {
        Some(target) => (target.is_loop(), target.disabled),
        None => {
            warn!(edge = %edge.id, target = %edge.target, "skipping edge to unknown node");
            return false;
        }
    };
    if disabled {
        debug!(edge = %edge.id, target = %edge.target, "skipping disabled node");
        return false;
    }
    if is_loop {
        if store.loop_active(&edge.target) {
            store.buffer_to_loop(&edge.target, &edge.id, payload);
            return false;
        }
        if !store.begin_activation(&edge.target) {
            warn!(loop_id = %edge.target, edge = %edge.id, "arrival dropped during loop activation");
            return false;
        }
        debug!(loop_id = %edge.target, edge = %edge.id, "cold loop entry");
    }
    if let Some((loop_id, iter)) = meta.scope() {
        queue.inc(&loop_id, iter);
    }
    queue.enqueue(
        WorkItem::new(edge.target.clone())
            .with_input(payload)
            .with_meta(meta.clone()),
    );
    true
}

/// The payload a fired edge carries. Conditional results shaped as
/// `{handle: items}` objects slice to the edge's handle (an `If` node's
/// partitioned items reach only their branch); everything else carries
/// the full result.
fn payload_for_edge(def: &Node, result: &Value, edge: &Edge) -> Value {
    if def.is_conditional() {
        if let (Value::Object(map), Some(handle)) = (result, &edge.source_handle) {
            if let Some(slice) = map.get(handle.as_str()) {
                return slice.clone();
            }
        }
    }
    result.clone()
}

/// Assemble the input an executor sees: the node's resolved `values`
/// merged with the work item's input, or with the upstream outputs when
/// the item carries none. Non-object payloads (item lists, scalars) pass
/// through unmerged; the resolved parameters still reach the executor on
/// the node definition.
fn assemble_input(
    params: &serde_json::Map<String, Value>,
    item: &WorkItem,
    def: &Node,
    workflow: &Workflow,
    store: &NodeStore,
) -> Value {
    let overlay: Option<Value> = match &item.input {
        Some(value) => Some(value.clone()),
        None => {
            let upstream: Vec<&Value> = workflow
                .incoming_edges(&def.id)
                .iter()
                .filter_map(|e| store.node_output(&e.source))
                .collect();
            match upstream.as_slice() {
                [] => None,
                [only] if !only.is_object() => Some((*only).clone()),
                many => {
                    let mut merged = serde_json::Map::new();
                    for value in many {
                        if let Value::Object(map) = value {
                            for (k, v) in map {
                                merged.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    (!merged.is_empty()).then_some(Value::Object(merged))
                }
            }
        }
    };

    match overlay {
        Some(Value::Object(overlay_map)) => {
            let mut merged = params.clone();
            for (k, v) in overlay_map {
                merged.insert(k, v);
            }
            Value::Object(merged)
        }
        Some(other) => other,
        None => Value::Object(params.clone()),
    }
}
