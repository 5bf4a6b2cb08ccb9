//! Edge selection from node results
//!
//! [`NodeRouter`] decides which outgoing edges fire after a node
//! completes. Data and side-effect nodes fan out to every successor;
//! conditional nodes (`If`, `Switch`) first reduce their result to a set
//! of allowed handles and fire only the edges whose `sourceHandle`
//! matches. Loops never go through [`NodeRouter::select`]; the loop
//! controller asks for [`NodeRouter::loop_body_edges`] and
//! [`NodeRouter::done_edges`] directly.
//!
//! Edges always fire in declaration order.

use crate::graph::{
    Edge, Node, NodeId, Workflow, HANDLE_DEFAULT, HANDLE_DONE, HANDLE_FALSE, HANDLE_LOOP,
    HANDLE_TRUE,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Routes node results onto outgoing edges.
#[derive(Debug)]
pub struct NodeRouter {
    outgoing: HashMap<NodeId, Vec<Edge>>,
}

impl NodeRouter {
    /// Index a workflow's edges by source node, preserving declaration
    /// order.
    pub fn new(workflow: &Workflow) -> Self {
        let mut outgoing: HashMap<NodeId, Vec<Edge>> = HashMap::new();
        for edge in &workflow.edges {
            outgoing
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
        }
        Self { outgoing }
    }

    /// All outgoing edges of a node, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> &[Edge] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The ordered list of edges to fire for `node`'s `result`.
    ///
    /// A conditional node with no matching handle fires no successor;
    /// that is a legal outcome, not an error. A result that is a list of
    /// items is never a handle set: it fans out to every successor like a
    /// data node.
    pub fn select(&self, node: &Node, result: &Value) -> Vec<&Edge> {
        let outgoing = self.outgoing(&node.id);
        if !node.is_conditional() || matches!(result, Value::Array(_)) {
            return outgoing.iter().collect();
        }

        let allowed = allowed_handles(result);
        outgoing
            .iter()
            .filter(|edge| match &edge.source_handle {
                Some(handle) => allowed.contains(handle.as_str()),
                None => allowed.contains("") || allowed.contains(HANDLE_DEFAULT),
            })
            .collect()
    }

    /// Outgoing edges carrying a loop's iteration payload: `sourceHandle`
    /// absent or `"loop"`.
    pub fn loop_body_edges(&self, loop_id: &str) -> Vec<&Edge> {
        self.outgoing(loop_id)
            .iter()
            .filter(|e| matches!(e.source_handle.as_deref(), None | Some(HANDLE_LOOP)))
            .collect()
    }

    /// Outgoing edges carrying a loop's final aggregate: `sourceHandle`
    /// equal to `"done"`.
    pub fn done_edges(&self, loop_id: &str) -> Vec<&Edge> {
        self.outgoing(loop_id)
            .iter()
            .filter(|e| e.source_handle.as_deref() == Some(HANDLE_DONE))
            .collect()
    }
}

/// Reduce a conditional node's result to the set of handles it allows.
/// Lists never reach here; [`NodeRouter::select`] fans them out
/// unfiltered.
///
/// - boolean → `{"true"}` or `{"false"}`
/// - string → the string itself (switch-case results)
/// - object containing `"true"` and/or `"false"` → the keys whose mapped
///   value is truthy
/// - anything else → the no-handle fallback `{"default", ""}`
fn allowed_handles(result: &Value) -> HashSet<String> {
    match result {
        Value::Bool(true) => HashSet::from([HANDLE_TRUE.to_string()]),
        Value::Bool(false) => HashSet::from([HANDLE_FALSE.to_string()]),
        Value::String(s) => HashSet::from([s.clone()]),
        Value::Object(map)
            if map.contains_key(HANDLE_TRUE) || map.contains_key(HANDLE_FALSE) =>
        {
            [HANDLE_TRUE, HANDLE_FALSE]
                .iter()
                .filter(|key| map.get(**key).is_some_and(is_truthy))
                .map(|key| key.to_string())
                .collect()
        }
        _ => HashSet::from([HANDLE_DEFAULT.to_string(), String::new()]),
    }
}

/// Truthiness of a payload value: null, `false`, zero, and the empty
/// string are falsy.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
