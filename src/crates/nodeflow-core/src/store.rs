//! Per-run node state
//!
//! [`NodeStore`] holds everything a single run mutates: node definitions,
//! the latest output per node, node states and errors, free-form per-node
//! scratch state for stateful executors, the [`LoopState`] table, and the
//! workflow-scoped persistent key/value map. Run history and persistent
//! state pass through the external
//! [`RunStore`](nodeflow_runstore::RunStore) capability; the store itself
//! is exclusively owned by one run and only touched from the engine's
//! single thread of control.

use crate::error::Result;
use crate::graph::{EdgeId, Node, NodeId, Workflow};
use chrono::{DateTime, Utc};
use nodeflow_runstore::{NodeExecutionRecord, PersistentState, RunStore};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Lifecycle state of a node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not yet dispatched
    Pending,
    /// Currently executing
    Running,
    /// Last execution produced an output
    Completed,
    /// Last execution failed
    Failed,
}

impl NodeState {
    /// Status string recorded in run history.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Completed => "completed",
            NodeState::Failed => "failed",
        }
    }
}

/// A recorded node error.
#[derive(Debug, Clone)]
pub struct NodeErrorRecord {
    /// Failure description
    pub message: String,
    /// When the error was recorded
    pub at: DateTime<Utc>,
}

/// Loop configuration derived from a `Loop` node's `values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Which upstream field holds the items to iterate
    pub input_array: String,
    /// Items per iteration, at least 1
    pub batch_size: usize,
    /// Per-item dispatch within a batch vs one whole-batch dispatch
    pub parallel: bool,
    /// Drop error arrivals instead of failing the loop
    pub continue_on_error: bool,
    /// Delay between an iteration's drain and the next tick
    pub throttle_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            input_array: "items".to_string(),
            batch_size: 1,
            parallel: false,
            continue_on_error: false,
            throttle_ms: 0,
        }
    }
}

impl LoopConfig {
    /// Derive the configuration from a node's raw `values`, applying
    /// defaults and clamping `batchSize` to at least 1.
    pub fn from_values(values: &serde_json::Map<String, Value>) -> Self {
        Self {
            input_array: values
                .get("inputArray")
                .and_then(Value::as_str)
                .unwrap_or("items")
                .to_string(),
            batch_size: values
                .get("batchSize")
                .and_then(Value::as_u64)
                .map(|n| n.max(1) as usize)
                .unwrap_or(1),
            parallel: values
                .get("parallel")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            continue_on_error: values
                .get("continueOnError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            throttle_ms: values.get("throttleMs").and_then(Value::as_u64).unwrap_or(0),
        }
    }

    /// Index of the last batch for `len` items.
    pub fn max_batch_index(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            (len + self.batch_size - 1) / self.batch_size - 1
        }
    }
}

/// Per-loop, per-run iteration state.
#[derive(Debug, Clone)]
pub struct LoopState {
    /// Ordered items being iterated
    pub loop_items: Vec<Value>,
    /// Index of the next batch to emit
    pub loop_index: usize,
    /// Configuration snapshot taken when the state was created
    pub config: LoopConfig,
    /// Feedback items accumulated across iterations
    pub aggregated: Vec<Value>,
    /// Last feedback payload per feeding edge for the current iteration,
    /// in first-write order
    edge_buf: Vec<(EdgeId, Value)>,
    /// Set once every batch has been emitted and drained
    pub finished: bool,
    /// Content hash of `loop_items` for re-entry change detection
    pub input_signature: u64,
}

impl LoopState {
    fn new(loop_items: Vec<Value>, config: LoopConfig) -> Self {
        let input_signature = items_signature(&loop_items);
        Self {
            loop_items,
            loop_index: 0,
            config,
            aggregated: Vec::new(),
            edge_buf: Vec::new(),
            finished: false,
            input_signature,
        }
    }
}

/// Content hash of a loop's item list, over its canonical JSON text.
fn items_signature(items: &[Value]) -> u64 {
    let text = serde_json::to_string(items).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Normalize a loop's upstream input into an item list.
///
/// An object input is first narrowed to its `input_array` field when that
/// field exists. Then: lists pass through, absent/null becomes empty, a
/// string parseable as JSON is parsed (lists as-is, anything else as a
/// singleton), and any other value becomes a singleton list.
fn normalize_loop_items(input: Option<&Value>, input_array: &str) -> Vec<Value> {
    let narrowed = match input {
        Some(Value::Object(map)) => map.get(input_array).or(input),
        other => other,
    };
    match narrowed {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items,
            Ok(parsed) => vec![parsed],
            Err(_) => vec![Value::String(s.clone())],
        },
        Some(other) => vec![other.clone()],
    }
}

/// In-memory run state with pass-through persistence.
pub struct NodeStore {
    workflow_id: String,
    defs: HashMap<NodeId, Node>,
    outputs: HashMap<NodeId, Value>,
    states: HashMap<NodeId, NodeState>,
    errors: HashMap<NodeId, NodeErrorRecord>,
    loops: HashMap<NodeId, LoopState>,
    iter_state: HashMap<(NodeId, String), Value>,
    /// Loops with a cold-start activation item in flight
    activations: HashSet<NodeId>,
    persistent: Arc<RwLock<PersistentState>>,
    run_store: Arc<dyn RunStore>,
}

impl NodeStore {
    /// Build the store for one run of `workflow`.
    pub fn new(workflow: &Workflow, run_store: Arc<dyn RunStore>, workflow_id: &str) -> Self {
        let defs = workflow
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        Self {
            workflow_id: workflow_id.to_string(),
            defs,
            outputs: HashMap::new(),
            states: HashMap::new(),
            errors: HashMap::new(),
            loops: HashMap::new(),
            iter_state: HashMap::new(),
            activations: HashSet::new(),
            persistent: Arc::new(RwLock::new(PersistentState::new())),
            run_store,
        }
    }

    /// Register (or replace) a node definition.
    pub fn set_node_def(&mut self, node: Node) {
        self.defs.insert(node.id.clone(), node);
    }

    /// Look up a node definition.
    pub fn node_def(&self, node_id: &str) -> Option<&Node> {
        self.defs.get(node_id)
    }

    /// Record a node's most recent completed output.
    pub fn set_node_output(&mut self, node_id: &str, output: Value) {
        self.outputs.insert(node_id.to_string(), output);
    }

    /// The most recent completed output of a node.
    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    /// All node outputs keyed by node id (the run result map).
    pub fn outputs_map(&self) -> serde_json::Map<String, Value> {
        self.outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Outputs keyed by both node id and display name, for template
    /// resolution.
    pub fn outputs_by_name(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        for (id, output) in &self.outputs {
            map.insert(id.clone(), output.clone());
            if let Some(def) = self.defs.get(id) {
                if let Some(name) = &def.name {
                    map.insert(name.clone(), output.clone());
                }
            }
        }
        map
    }

    /// Set a node's lifecycle state.
    pub fn set_node_state(&mut self, node_id: &str, state: NodeState) {
        self.states.insert(node_id.to_string(), state);
    }

    /// A node's lifecycle state, `Pending` when never dispatched.
    pub fn node_state(&self, node_id: &str) -> NodeState {
        self.states
            .get(node_id)
            .copied()
            .unwrap_or(NodeState::Pending)
    }

    /// Record a node error.
    pub fn set_node_error(&mut self, node_id: &str, message: impl Into<String>) {
        self.errors.insert(
            node_id.to_string(),
            NodeErrorRecord {
                message: message.into(),
                at: Utc::now(),
            },
        );
    }

    /// A node's recorded error, if any.
    pub fn node_error(&self, node_id: &str) -> Option<&NodeErrorRecord> {
        self.errors.get(node_id)
    }

    // ------------------------------------------------------------------
    // Loop state
    // ------------------------------------------------------------------

    /// Ensure a loop has iteration state for `input`.
    ///
    /// An unfinished state is kept untouched (the loop is mid-cycle). A
    /// finished state is kept when the normalized input hashes to the same
    /// signature (idempotent re-entry) and replaced with a fresh state
    /// when it differs (a new cycle over new items).
    pub fn ensure_loop_state(
        &mut self,
        loop_id: &str,
        input: Option<&Value>,
        config: LoopConfig,
    ) -> &LoopState {
        let items = normalize_loop_items(input, &config.input_array);
        let signature = items_signature(&items);

        let replace = match self.loops.get(loop_id) {
            Some(st) if !st.finished => false,
            Some(st) => st.input_signature != signature,
            None => true,
        };
        if replace {
            self.loops
                .insert(loop_id.to_string(), LoopState::new(items, config));
        }
        &self.loops[loop_id]
    }

    /// A loop's state, if it ever started.
    pub fn loop_state(&self, loop_id: &str) -> Option<&LoopState> {
        self.loops.get(loop_id)
    }

    /// Whether the loop is mid-cycle (has unfinished state).
    pub fn loop_active(&self, loop_id: &str) -> bool {
        self.loops.get(loop_id).is_some_and(|st| !st.finished)
    }

    /// Advance the loop to the next batch; returns the index of the batch
    /// being dispatched.
    pub fn advance_loop_index(&mut self, loop_id: &str) -> usize {
        let st = self
            .loops
            .get_mut(loop_id)
            .unwrap_or_else(|| panic!("advance on loop '{loop_id}' with no state"));
        let dispatched = st.loop_index;
        st.loop_index += 1;
        dispatched
    }

    /// Append drain arrivals to the loop's aggregate. List arrivals are
    /// flattened; anything else is appended as one item.
    pub fn append_aggregate(&mut self, loop_id: &str, arrivals: Vec<Value>) {
        let Some(st) = self.loops.get_mut(loop_id) else {
            warn!(loop_id, "aggregate append on loop with no state");
            return;
        };
        for arrival in arrivals {
            match arrival {
                Value::Array(items) => st.aggregated.extend(items),
                other => st.aggregated.push(other),
            }
        }
    }

    /// Buffer a feedback payload on the loop's per-edge slot. Within one
    /// iteration the slot keeps the last payload per edge; slots preserve
    /// first-write order.
    pub fn buffer_to_loop(&mut self, loop_id: &str, edge_id: &str, payload: Value) {
        let Some(st) = self.loops.get_mut(loop_id) else {
            warn!(loop_id, edge_id, "feedback dropped: loop has no state");
            return;
        };
        if st.finished {
            warn!(loop_id, edge_id, "feedback dropped: loop already finished");
            return;
        }
        match st.edge_buf.iter_mut().find(|(id, _)| id == edge_id) {
            Some((_, slot)) => *slot = payload,
            None => st.edge_buf.push((edge_id.to_string(), payload)),
        }
    }

    /// Take the buffered feedback payloads in first-write order, emptying
    /// the buffer.
    pub fn consume_edge_buf(&mut self, loop_id: &str) -> Vec<Value> {
        self.loops
            .get_mut(loop_id)
            .map(|st| std::mem::take(&mut st.edge_buf))
            .unwrap_or_default()
            .into_iter()
            .map(|(_, payload)| payload)
            .collect()
    }

    /// Mark a loop finished: the index is cleared and the edge buffer
    /// dropped; the aggregate stays readable for the done edges.
    pub fn finish_loop(&mut self, loop_id: &str) {
        if let Some(st) = self.loops.get_mut(loop_id) {
            st.finished = true;
            st.loop_index = 0;
            st.edge_buf.clear();
        }
    }

    /// Claim the cold-start activation slot for a loop. Returns false
    /// when an activation is already in flight.
    pub fn begin_activation(&mut self, loop_id: &str) -> bool {
        self.activations.insert(loop_id.to_string())
    }

    /// Release the activation slot (the loop's first tick is running).
    pub fn end_activation(&mut self, loop_id: &str) {
        self.activations.remove(loop_id);
    }

    // ------------------------------------------------------------------
    // Per-node scratch state
    // ------------------------------------------------------------------

    /// Set a free-form per-node state value (streaming indicators and
    /// other stateful executors).
    pub fn set_node_state_key(&mut self, node_id: &str, key: &str, value: Value) {
        self.iter_state
            .insert((node_id.to_string(), key.to_string()), value);
    }

    /// Read a free-form per-node state value.
    pub fn node_state_key(&self, node_id: &str, key: &str) -> Option<&Value> {
        self.iter_state.get(&(node_id.to_string(), key.to_string()))
    }

    // ------------------------------------------------------------------
    // RunStore passthroughs
    // ------------------------------------------------------------------

    /// Load the workflow's persistent state from the run store.
    pub async fn load_persistent(&mut self) -> Result<()> {
        let state = self
            .run_store
            .load_persistent_state(&self.workflow_id)
            .await?;
        *self.persistent.write().await = state;
        Ok(())
    }

    /// Shared handle on the persistent map for execution contexts.
    pub fn persistent_handle(&self) -> Arc<RwLock<PersistentState>> {
        Arc::clone(&self.persistent)
    }

    /// Record one node execution in run history. Fire-and-forget:
    /// failures are logged, never fatal.
    pub async fn record_node_execution(&self, record: NodeExecutionRecord) {
        if let Err(err) = self.run_store.record_node_execution(record).await {
            warn!(error = %err, "failed to record node execution");
        }
    }
}
