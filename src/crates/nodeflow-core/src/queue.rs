//! Work queue and iteration-scope refcounting
//!
//! [`QueueManager`] is a strict FIFO of [`WorkItem`]s plus the bookkeeping
//! that tells a loop when one iteration's body subtree has finished: every
//! work item belonging to an iteration scope `(loop_id, iter_index)`
//! increments the scope's pending counter on enqueue (and again while it
//! executes), and decrements it when fully processed. When an *armed*
//! scope transitions `pending > 0 → 0`, [`QueueManager::dec`] hands back a
//! [`DrainSignal`] and the engine dispatches the loop controller's drain
//! routine.
//!
//! The signal-on-dec form is the completion-channel equivalent of a
//! registered drain callback: a boxed closure would need mutable access to
//! the node store and queue that the engine loop already holds, so the
//! scope is armed with [`QueueManager::on_iteration_drain`] and the signal
//! travels back through the return value. The observable contract is
//! unchanged: the drain fires exactly once per armed scope that saw at
//! least one increment, and re-arming resets the latch.
//!
//! Ordering contract: dequeue order equals enqueue order, with no
//! reordering anywhere in the engine.

use crate::graph::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Iteration-scope metadata carried by work items dispatched inside a
/// loop body (and by the loop's own tick items).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMeta {
    /// Loop whose iteration this item belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_loop_id: Option<NodeId>,

    /// Iteration (batch index) within the loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iter_index: Option<usize>,

    /// Item index within the batch, set in parallel dispatch mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,

    /// Whether this item was dispatched per-item rather than per-batch
    #[serde(default)]
    pub parallel: bool,
}

impl WorkMeta {
    /// The iteration scope this item is counted under, when both parts
    /// are present.
    pub fn scope(&self) -> Option<IterationKey> {
        match (&self.origin_loop_id, self.iter_index) {
            (Some(loop_id), Some(iter)) => Some((loop_id.clone(), iter)),
            _ => None,
        }
    }
}

/// One unit of schedulable work: execute `node_id` with `input`.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Node to execute
    pub node_id: NodeId,

    /// Payload for the execution; successors without one read upstream
    /// outputs instead
    pub input: Option<Value>,

    /// Iteration-scope metadata
    pub meta: WorkMeta,
}

impl WorkItem {
    /// Create a work item with no input and no scope.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            input: None,
            meta: WorkMeta::default(),
        }
    }

    /// Attach an input payload.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Attach iteration-scope metadata.
    pub fn with_meta(mut self, meta: WorkMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// Identifies one loop iteration: `(loop_id, iter_index)`.
pub type IterationKey = (NodeId, usize);

/// Emitted by [`QueueManager::dec`] when an armed iteration scope drains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSignal {
    /// Loop whose iteration drained
    pub loop_id: NodeId,
    /// Iteration that drained
    pub iter_index: usize,
}

#[derive(Debug, Default)]
struct IterationScope {
    pending: u32,
    /// Whether any inc has ever been seen; a drain only fires after one
    incremented: bool,
    armed: bool,
    fired: bool,
}

/// Strict FIFO work queue with per-iteration refcounts.
#[derive(Debug, Default)]
pub struct QueueManager {
    items: VecDeque<WorkItem>,
    scopes: HashMap<IterationKey, IterationScope>,
}

impl QueueManager {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a work item to the tail.
    pub fn enqueue(&mut self, item: WorkItem) {
        debug!(node = %item.node_id, queued = self.items.len() + 1, "enqueue");
        self.items.push_back(item);
    }

    /// Remove and return the head item, if any.
    pub fn dequeue(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Increment the pending counter for an iteration scope, creating the
    /// scope entry if absent.
    pub fn inc(&mut self, loop_id: &str, iter_index: usize) {
        let scope = self
            .scopes
            .entry((loop_id.to_string(), iter_index))
            .or_default();
        scope.pending += 1;
        scope.incremented = true;
        debug!(loop_id, iter_index, pending = scope.pending, "scope inc");
    }

    /// Decrement the pending counter for an iteration scope.
    ///
    /// Returns a [`DrainSignal`] when the counter reaches zero on an armed
    /// scope that has not fired yet. Decrementing a scope that was never
    /// incremented is a scheduler invariant violation and aborts.
    pub fn dec(&mut self, loop_id: &str, iter_index: usize) -> Option<DrainSignal> {
        let key = (loop_id.to_string(), iter_index);
        let scope = self
            .scopes
            .get_mut(&key)
            .unwrap_or_else(|| panic!("dec on unknown iteration scope {loop_id}#{iter_index}"));
        assert!(
            scope.pending > 0,
            "refcount underflow on iteration scope {loop_id}#{iter_index}"
        );
        scope.pending -= 1;
        debug!(loop_id, iter_index, pending = scope.pending, "scope dec");

        if scope.pending == 0 && scope.armed && !scope.fired && scope.incremented {
            scope.fired = true;
            debug!(loop_id, iter_index, "iteration drained");
            return Some(DrainSignal {
                loop_id: loop_id.to_string(),
                iter_index,
            });
        }
        None
    }

    /// Arm (or re-arm) the drain for an iteration scope. Legal before any
    /// `inc`; re-arming after a fire resets the once-only latch.
    pub fn on_iteration_drain(&mut self, loop_id: &str, iter_index: usize) {
        let scope = self
            .scopes
            .entry((loop_id.to_string(), iter_index))
            .or_default();
        scope.armed = true;
        scope.fired = false;
    }

    /// Pending counter for a scope; zero when the scope does not exist.
    pub fn pending(&self, loop_id: &str, iter_index: usize) -> u32 {
        self.scopes
            .get(&(loop_id.to_string(), iter_index))
            .map(|s| s.pending)
            .unwrap_or(0)
    }

    /// Abandon all queued items and scope state (cancellation/teardown).
    pub fn clear(&mut self) {
        self.items.clear();
        self.scopes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = QueueManager::new();
        queue.enqueue(WorkItem::new("a"));
        queue.enqueue(WorkItem::new("b"));
        queue.enqueue(WorkItem::new("c"));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap().node_id, "a");
        assert_eq!(queue.dequeue().unwrap().node_id, "b");
        assert_eq!(queue.dequeue().unwrap().node_id, "c");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_drain_fires_once_at_zero() {
        let mut queue = QueueManager::new();
        queue.inc("loop1", 0);
        queue.inc("loop1", 0);
        queue.on_iteration_drain("loop1", 0);

        assert!(queue.dec("loop1", 0).is_none());
        let signal = queue.dec("loop1", 0).expect("drain should fire");
        assert_eq!(signal.loop_id, "loop1");
        assert_eq!(signal.iter_index, 0);

        // A later inc/dec round on the same scope stays silent until
        // re-armed.
        queue.inc("loop1", 0);
        assert!(queue.dec("loop1", 0).is_none());

        queue.on_iteration_drain("loop1", 0);
        queue.inc("loop1", 0);
        assert!(queue.dec("loop1", 0).is_some());
    }

    #[test]
    fn test_arm_before_any_inc() {
        let mut queue = QueueManager::new();
        queue.on_iteration_drain("loop1", 3);
        queue.inc("loop1", 3);
        assert!(queue.dec("loop1", 3).is_some());
    }

    #[test]
    fn test_unarmed_scope_never_signals() {
        let mut queue = QueueManager::new();
        queue.inc("loop1", 0);
        assert!(queue.dec("loop1", 0).is_none());
    }

    #[test]
    fn test_scopes_are_independent() {
        let mut queue = QueueManager::new();
        queue.on_iteration_drain("loop1", 0);
        queue.on_iteration_drain("loop1", 1);
        queue.inc("loop1", 0);
        queue.inc("loop1", 1);

        assert!(queue.dec("loop1", 1).is_some());
        assert!(queue.dec("loop1", 0).is_some());
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn test_underflow_aborts() {
        let mut queue = QueueManager::new();
        queue.inc("loop1", 0);
        queue.dec("loop1", 0);
        queue.dec("loop1", 0);
    }

    #[test]
    fn test_clear_abandons_state() {
        let mut queue = QueueManager::new();
        queue.enqueue(WorkItem::new("a"));
        queue.inc("loop1", 0);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pending("loop1", 0), 0);
    }

    proptest! {
        /// Dequeue order always equals enqueue order.
        #[test]
        fn prop_fifo(ids in proptest::collection::vec("[a-z]{1,8}", 0..64)) {
            let mut queue = QueueManager::new();
            for id in &ids {
                queue.enqueue(WorkItem::new(id.clone()));
            }
            let mut out = Vec::new();
            while let Some(item) = queue.dequeue() {
                out.push(item.node_id);
            }
            prop_assert_eq!(out, ids);
        }

        /// An armed scope signals exactly once, on the dec that balances
        /// the incs.
        #[test]
        fn prop_drain_once(n in 1u32..32) {
            let mut queue = QueueManager::new();
            queue.on_iteration_drain("l", 0);
            for _ in 0..n {
                queue.inc("l", 0);
            }
            let mut signals = 0;
            for _ in 0..n {
                if queue.dec("l", 0).is_some() {
                    signals += 1;
                }
            }
            prop_assert_eq!(signals, 1);
            prop_assert_eq!(queue.pending("l", 0), 0);
        }
    }
}
