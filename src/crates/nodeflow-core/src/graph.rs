//! Workflow graph model
//!
//! A workflow is a pair of `nodes` and `edges` produced by the visual
//! editor and validated here before execution. Nodes are heterogeneous
//! operators identified by a `type` (routing behavior) and a `category`
//! (which [`Executor`](crate::executor::Executor) runs them); edges carry
//! an optional `sourceHandle` label that the router matches against node
//! results.
//!
//! ```text
//!            ┌────────┐  true   ┌──────────┐
//!   start ──▶│  if1   │────────▶│ trueNode │
//!            │ (If)   │  false  ├──────────┤
//!            └────────┘────────▶│ falseNode│
//!                               └──────────┘
//!
//!            ┌────────┐  loop   ┌──────────┐
//!   items ──▶│  loop1 │────────▶│ process  │──┐ (feedback,
//!            │ (Loop) │  done   └──────────┘  │  buffered)
//!            └────────┘◀──────────────────────┘
//!                 └──────────▶ output
//! ```
//!
//! The graph is immutable for the duration of a run.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Node identifier - unique name for each node in the graph
pub type NodeId = String;

/// Edge identifier - unique per edge
pub type EdgeId = String;

/// Handle fired by an `If` node's true branch (and by truthy boolean
/// results in general)
pub const HANDLE_TRUE: &str = "true";

/// Handle fired by an `If` node's false branch
pub const HANDLE_FALSE: &str = "false";

/// Handle carrying a loop's per-iteration payload
pub const HANDLE_LOOP: &str = "loop";

/// Handle carrying a loop's final aggregate, fired once
pub const HANDLE_DONE: &str = "done";

/// Fallback handle for results that name no specific branch
pub const HANDLE_DEFAULT: &str = "default";

/// Node type with true/false conditional routing
pub const TYPE_IF: &str = "If";

/// Node type with case-name conditional routing
pub const TYPE_SWITCH: &str = "Switch";

/// Node type driven by the loop controller instead of an executor
pub const TYPE_LOOP: &str = "Loop";

/// One operator node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node id
    #[serde(alias = "nodeId")]
    pub id: NodeId,

    /// Display name shown in the editor; templates reference nodes by
    /// this name (falling back to the id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Routing behavior (`If`, `Switch`, `Loop`, `Edit Fields`, ...)
    #[serde(rename = "type")]
    pub node_type: String,

    /// Selects the executor that runs this node
    pub category: String,

    /// Raw parameter values, possibly containing `{{ ... }}` templates
    #[serde(default)]
    pub values: serde_json::Map<String, Value>,

    /// Opaque passthrough map (editor positions, annotations)
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,

    /// Disabled nodes are never seeded or dispatched
    #[serde(default)]
    pub disabled: bool,
}

impl Node {
    /// The name templates resolve this node by.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Whether the router filters this node's outgoing edges by handle.
    pub fn is_conditional(&self) -> bool {
        matches!(self.node_type.as_str(), TYPE_IF | TYPE_SWITCH)
    }

    /// Whether this node is driven by the loop controller.
    pub fn is_loop(&self) -> bool {
        self.node_type == TYPE_LOOP
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Unique edge id
    #[serde(alias = "edgeId")]
    pub id: EdgeId,

    /// Source node id
    pub source: NodeId,

    /// Target node id
    pub target: NodeId,

    /// Handle label matched against the source node's result (`true`,
    /// `false`, `loop`, `done`, a switch case name, or absent)
    #[serde(
        default,
        rename = "sourceHandle",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_handle: Option<String>,
}

/// A validated workflow graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow id; generated when the input leaves it blank
    #[serde(default)]
    pub id: String,

    /// All nodes, in declaration order
    pub nodes: Vec<Node>,

    /// All edges, in declaration order
    pub edges: Vec<Edge>,
}

impl Workflow {
    /// Build a workflow from parts.
    pub fn new(id: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            id: id.into(),
            nodes,
            edges,
        }
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Validate the graph structure: unique node and edge ids, and edge
    /// endpoints that reference existing nodes.
    pub fn validate(&self) -> Result<()> {
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut edge_ids = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate edge id '{}'",
                    edge.id
                )));
            }
            if !node_ids.contains(edge.source.as_str()) {
                return Err(EngineError::Validation(format!(
                    "edge '{}' source '{}' does not exist",
                    edge.id, edge.source
                )));
            }
            if !node_ids.contains(edge.target.as_str()) {
                return Err(EngineError::Validation(format!(
                    "edge '{}' target '{}' does not exist",
                    edge.id, edge.target
                )));
            }
        }

        Ok(())
    }

    /// Entry nodes: enabled nodes with no incoming edges. The engine
    /// seeds its queue with these.
    pub fn entry_nodes(&self) -> Vec<&Node> {
        let targets: HashSet<&str> = self.edges.iter().map(|e| e.target.as_str()).collect();
        self.nodes
            .iter()
            .filter(|n| !n.disabled && !targets.contains(n.id.as_str()))
            .collect()
    }

    /// Incoming edges of a node, in declaration order.
    pub fn incoming_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: &str) -> Node {
        Node {
            id: id.to_string(),
            name: None,
            node_type: node_type.to_string(),
            category: "test".to_string(),
            values: Default::default(),
            data: Default::default(),
            disabled: false,
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> Edge {
        Edge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            source_handle: None,
        }
    }

    #[test]
    fn test_validate_ok() {
        let wf = Workflow::new(
            "wf",
            vec![node("a", "Math"), node("b", "Math")],
            vec![edge("e1", "a", "b")],
        );
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_node() {
        let wf = Workflow::new("wf", vec![node("a", "Math"), node("a", "Math")], vec![]);
        assert!(matches!(wf.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_validate_dangling_edge() {
        let wf = Workflow::new("wf", vec![node("a", "Math")], vec![edge("e1", "a", "ghost")]);
        assert!(matches!(wf.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_entry_nodes_skip_disabled() {
        let mut off = node("off", "Math");
        off.disabled = true;
        let wf = Workflow::new(
            "wf",
            vec![node("a", "Math"), node("b", "Math"), off],
            vec![edge("e1", "a", "b")],
        );
        let entries: Vec<&str> = wf.entry_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(entries, vec!["a"]);
    }

    #[test]
    fn test_deserialize_wire_format() {
        let json = serde_json::json!({
            "nodes": [
                {"id": "n1", "type": "If", "category": "logic",
                 "values": {"left": "{{ value }}", "operator": "gt", "right": 5}}
            ],
            "edges": [
                {"id": "e1", "source": "n1", "target": "n1", "sourceHandle": "true"}
            ]
        });
        let wf: Workflow = serde_json::from_value(json).unwrap();
        assert!(wf.nodes[0].is_conditional());
        assert_eq!(wf.edges[0].source_handle.as_deref(), Some("true"));
    }
}
