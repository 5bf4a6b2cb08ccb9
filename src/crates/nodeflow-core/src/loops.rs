//! Loop tick / feedback / drain protocol
//!
//! A `Loop` node is not run by an executor; the engine hands its work
//! items to [`LoopController::tick`]. One tick emits at most one batch of
//! items onto the loop's body edges and arms the iteration's drain; the
//! body subtree then executes as ordinary queued work, feeding results
//! *back* into the loop through its edge buffer (never the queue). When
//! the iteration's refcount drains, [`LoopController::handle_drain`]
//! collects the buffered arrivals, aggregates them, and either enqueues
//! the next tick or finishes the loop and fires its done edges with the
//! final aggregate.
//!
//! ```text
//! tick i:  slice batch ──▶ decorate ──▶ dispatch body edges ──▶ arm drain
//!                                             │
//!              body subtree runs, results buffer on feedback edges
//!                                             │
//! drain i: throttle ─▶ consume edgeBuf ─▶ aggregate ─▶ next tick / done
//! ```
//!
//! Items dispatched to the body carry a `$loopContext` field so executors
//! can observe their position within the batch; error records travel the
//! same feedback channel as data, marked with `$error`.

use crate::engine::route_edge;
use crate::error::{EngineError, Result};
use crate::graph::Edge;
use crate::queue::{QueueManager, WorkItem, WorkMeta};
use crate::router::NodeRouter;
use crate::store::{LoopConfig, NodeState, NodeStore};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Field added to every object item dispatched on a body edge.
pub const LOOP_CONTEXT_KEY: &str = "$loopContext";

/// Field marking a payload as an error record.
pub const ERROR_KEY: &str = "$error";

/// Build an error record payload for a failed node.
pub fn error_record(node: &str, message: &str) -> Value {
    json!({ ERROR_KEY: { "node": node, "message": message } })
}

/// Whether a payload is an error record.
pub fn is_error_record(value: &Value) -> bool {
    value.get(ERROR_KEY).is_some()
}

fn error_message(record: &Value) -> String {
    record
        .get(ERROR_KEY)
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

/// Decorate one item with its iteration context. Non-object items pass
/// through untouched.
fn decorate_item(item: &Value, iteration: usize, item_index: usize, batch_len: usize) -> Value {
    match item {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert(
                LOOP_CONTEXT_KEY.to_string(),
                json!({
                    "iterationIndex": iteration,
                    "itemIndex": item_index,
                    "batchSize": batch_len,
                    "isFirstItem": item_index == 0,
                    "isLastItem": item_index == batch_len - 1,
                }),
            );
            Value::Object(map)
        }
        other => other.clone(),
    }
}

/// Drives loop nodes through their tick/drain protocol.
#[derive(Debug, Default)]
pub struct LoopController;

impl LoopController {
    /// Create a controller.
    pub fn new() -> Self {
        Self
    }

    /// Run one tick of `loop_id`: ensure state for `input`, emit the next
    /// batch onto the body edges, and arm the iteration's drain.
    pub async fn tick(
        &self,
        loop_id: &str,
        input: Option<&Value>,
        store: &mut NodeStore,
        queue: &mut QueueManager,
        router: &NodeRouter,
    ) -> Result<()> {
        let config = {
            let def = store
                .node_def(loop_id)
                .ok_or_else(|| EngineError::UnknownNode(loop_id.to_string()))?;
            LoopConfig::from_values(&def.values)
        };

        let (items, batch_size, parallel, finished) = {
            let st = store.ensure_loop_state(loop_id, input, config);
            (
                st.loop_items.clone(),
                st.config.batch_size,
                st.config.parallel,
                st.finished,
            )
        };

        if finished {
            debug!(loop_id, "tick on finished loop ignored");
            return Ok(());
        }

        if items.is_empty() {
            debug!(loop_id, "no items; finishing immediately");
            store.finish_loop(loop_id);
            store.set_node_output(loop_id, Value::Array(Vec::new()));
            store.set_node_state(loop_id, NodeState::Completed);
            self.fire_done(loop_id, store, queue, router);
            return Ok(());
        }

        let iter = store.advance_loop_index(loop_id);
        let start = iter * batch_size;
        assert!(
            start < items.len(),
            "batch index {iter} out of range for loop '{loop_id}'"
        );
        let end = (start + batch_size).min(items.len());
        let batch: Vec<Value> = items[start..end]
            .iter()
            .enumerate()
            .map(|(idx, item)| decorate_item(item, iter, idx, end - start))
            .collect();
        debug!(loop_id, iteration = iter, batch = batch.len(), parallel, "dispatching batch");

        // The mid-run observable output is the batch being dispatched.
        store.set_node_output(loop_id, Value::Array(batch.clone()));

        let body: Vec<Edge> = router
            .loop_body_edges(loop_id)
            .into_iter()
            .cloned()
            .collect();

        let mut dispatched = 0usize;
        if parallel {
            for (idx, item) in batch.iter().enumerate() {
                for edge in &body {
                    let meta = WorkMeta {
                        origin_loop_id: Some(loop_id.to_string()),
                        iter_index: Some(iter),
                        item_index: Some(idx),
                        parallel: true,
                    };
                    if route_edge(store, queue, edge, item.clone(), &meta) {
                        dispatched += 1;
                    }
                }
            }
        } else {
            for edge in &body {
                let meta = WorkMeta {
                    origin_loop_id: Some(loop_id.to_string()),
                    iter_index: Some(iter),
                    item_index: None,
                    parallel: false,
                };
                if route_edge(store, queue, edge, Value::Array(batch.clone()), &meta) {
                    dispatched += 1;
                }
            }
        }

        if dispatched == 0 {
            // Degenerate body: nothing was enqueued for this iteration,
            // so the drain runs inline with no arrivals.
            return self.handle_drain(loop_id, iter, store, queue, router).await;
        }
        queue.on_iteration_drain(loop_id, iter);
        Ok(())
    }

    /// Handle the drain of `(loop_id, iter_index)`: collect the buffered
    /// feedback, aggregate it, and continue or finish the loop.
    pub async fn handle_drain(
        &self,
        loop_id: &str,
        iter_index: usize,
        store: &mut NodeStore,
        queue: &mut QueueManager,
        router: &NodeRouter,
    ) -> Result<()> {
        let (throttle_ms, continue_on_error) = match store.loop_state(loop_id) {
            Some(st) => (st.config.throttle_ms, st.config.continue_on_error),
            None => {
                warn!(loop_id, iter_index, "drain on loop with no state");
                return Ok(());
            }
        };

        if throttle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(throttle_ms)).await;
        }

        let arrivals = store.consume_edge_buf(loop_id);
        debug!(loop_id, iter_index, arrivals = arrivals.len(), "iteration drained");

        let kept: Vec<Value> = if continue_on_error {
            arrivals
                .into_iter()
                .filter(|arrival| {
                    if is_error_record(arrival) {
                        warn!(
                            loop_id,
                            iter_index,
                            message = %error_message(arrival),
                            "dropping error arrival"
                        );
                        false
                    } else {
                        true
                    }
                })
                .collect()
        } else {
            if let Some(record) = arrivals.iter().find(|a| is_error_record(a)) {
                let message = error_message(record);
                store.set_node_error(
                    loop_id,
                    format!("iteration {iter_index} failed: {message}"),
                );
                store.set_node_state(loop_id, NodeState::Failed);
                return Err(EngineError::loop_iteration(loop_id, iter_index, message));
            }
            arrivals
        };

        store.append_aggregate(loop_id, kept);

        let (next_index, items_len, items, aggregated, max_batch) = {
            let Some(st) = store.loop_state(loop_id) else {
                return Ok(());
            };
            (
                st.loop_index,
                st.loop_items.len(),
                st.loop_items.clone(),
                st.aggregated.clone(),
                st.config.max_batch_index(st.loop_items.len()),
            )
        };

        if next_index > max_batch || items_len == 0 {
            store.finish_loop(loop_id);
            store.set_node_output(loop_id, Value::Array(aggregated));
            store.set_node_state(loop_id, NodeState::Completed);
            self.fire_done(loop_id, store, queue, router);
        } else {
            queue.inc(loop_id, next_index);
            queue.enqueue(
                WorkItem::new(loop_id)
                    .with_input(Value::Array(items))
                    .with_meta(WorkMeta {
                        origin_loop_id: Some(loop_id.to_string()),
                        iter_index: Some(next_index),
                        item_index: None,
                        parallel: false,
                    }),
            );
        }
        Ok(())
    }

    /// Fire the done edges with the loop's final aggregate.
    fn fire_done(
        &self,
        loop_id: &str,
        store: &mut NodeStore,
        queue: &mut QueueManager,
        router: &NodeRouter,
    ) {
        let aggregate = store
            .node_output(loop_id)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let done: Vec<Edge> = router.done_edges(loop_id).into_iter().cloned().collect();
        for edge in &done {
            route_edge(store, queue, edge, aggregate.clone(), &WorkMeta::default());
        }
    }
}
