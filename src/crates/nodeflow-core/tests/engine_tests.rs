//! End-to-end engine scenarios
//!
//! Each test builds a small workflow graph, registers the test executors
//! it needs, and runs the engine over the in-memory run store, asserting
//! on the final per-node result map.

use async_trait::async_trait;
use nodeflow_core::{
    CancelToken, Edge, Engine, ExecResult, ExecutionContext, Executor, ExecutorError,
    ExecutorRegistry, Node, Workflow, LOOP_CONTEXT_KEY,
};
use nodeflow_runstore::InMemoryRunStore;
use serde_json::{json, Value};
use std::sync::Arc;

fn node(id: &str, node_type: &str, category: &str, values: Value) -> Node {
    Node {
        id: id.to_string(),
        name: None,
        node_type: node_type.to_string(),
        category: category.to_string(),
        values: values.as_object().cloned().unwrap_or_default(),
        data: Default::default(),
        disabled: false,
    }
}

fn edge(id: &str, source: &str, target: &str, handle: Option<&str>) -> Edge {
    Edge {
        id: id.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        source_handle: handle.map(String::from),
    }
}

/// Emits the node's `payload` parameter.
struct Emit;

#[async_trait]
impl Executor for Emit {
    fn category(&self) -> &str {
        "emit"
    }

    async fn execute(&self, node: &Node, _input: Value, _ctx: &ExecutionContext) -> ExecResult {
        Ok(node.values.get("payload").cloned().unwrap_or(Value::Null))
    }
}

/// Echoes its input.
struct Passthrough;

#[async_trait]
impl Executor for Passthrough {
    fn category(&self) -> &str {
        "passthrough"
    }

    async fn execute(&self, _node: &Node, input: Value, _ctx: &ExecutionContext) -> ExecResult {
        Ok(input)
    }
}

/// `If` conditions over a `field` / `operator` / `value` config. List
/// inputs partition into `{"true": [...], "false": [...]}`; anything else
/// evaluates to a plain boolean.
struct ConditionIf;

fn matches_condition(item: &Value, field: &str, operator: &str, rhs: &Value) -> bool {
    let lhs = item.get(field).unwrap_or(&Value::Null);
    match operator {
        "eq" => lhs == rhs,
        "gt" => lhs
            .as_f64()
            .zip(rhs.as_f64())
            .is_some_and(|(a, b)| a > b),
        "lt" => lhs
            .as_f64()
            .zip(rhs.as_f64())
            .is_some_and(|(a, b)| a < b),
        _ => false,
    }
}

#[async_trait]
impl Executor for ConditionIf {
    fn category(&self) -> &str {
        "logic"
    }

    async fn execute(&self, node: &Node, input: Value, _ctx: &ExecutionContext) -> ExecResult {
        let field = node
            .values
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::invalid_parameter("missing 'field'"))?;
        let operator = node
            .values
            .get("operator")
            .and_then(Value::as_str)
            .unwrap_or("eq");
        let rhs = node.values.get("value").cloned().unwrap_or(Value::Null);

        match input {
            Value::Array(items) => {
                let (pass, fail): (Vec<Value>, Vec<Value>) = items
                    .into_iter()
                    .partition(|item| matches_condition(item, field, operator, &rhs));
                Ok(json!({"true": pass, "false": fail}))
            }
            other => Ok(Value::Bool(matches_condition(&other, field, operator, &rhs))),
        }
    }
}

/// Returns the node's `result` parameter as a switch-case handle.
struct SwitchCase;

#[async_trait]
impl Executor for SwitchCase {
    fn category(&self) -> &str {
        "switch"
    }

    async fn execute(&self, node: &Node, _input: Value, _ctx: &ExecutionContext) -> ExecResult {
        Ok(node.values.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Multiplies each item's `v` by 2, preserving other fields.
struct Doubler;

fn map_items(input: Value, f: impl Fn(&Value) -> Result<Value, ExecutorError>) -> ExecResult {
    match input {
        Value::Array(items) => items
            .iter()
            .map(&f)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => f(&other),
    }
}

#[async_trait]
impl Executor for Doubler {
    fn category(&self) -> &str {
        "double"
    }

    async fn execute(&self, _node: &Node, input: Value, _ctx: &ExecutionContext) -> ExecResult {
        map_items(input, |item| {
            let mut out = item.as_object().cloned().unwrap_or_default();
            let v = item.get("v").and_then(Value::as_i64).unwrap_or(0);
            out.insert("v".to_string(), json!(v * 2));
            Ok(Value::Object(out))
        })
    }
}

/// Divides each item's `v` by 5; fails on zero.
struct DivideBy5;

#[async_trait]
impl Executor for DivideBy5 {
    fn category(&self) -> &str {
        "divide"
    }

    async fn execute(&self, _node: &Node, input: Value, _ctx: &ExecutionContext) -> ExecResult {
        map_items(input, |item| {
            let v = item.get("v").and_then(Value::as_i64).unwrap_or(0);
            if v == 0 {
                return Err(ExecutorError::failure("division by zero"));
            }
            let mut out = item.as_object().cloned().unwrap_or_default();
            out.insert("v".to_string(), json!(v / 5));
            Ok(Value::Object(out))
        })
    }
}

/// Increments the workflow-scoped `globalCounter` persistent value.
struct Counter;

#[async_trait]
impl Executor for Counter {
    fn category(&self) -> &str {
        "counter"
    }

    async fn execute(&self, _node: &Node, _input: Value, ctx: &ExecutionContext) -> ExecResult {
        let current = ctx
            .get_persistent_value("globalCounter")
            .await
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let next = current + 1;
        ctx.set_persistent_value("globalCounter", json!(next))
            .await
            .map_err(|e| ExecutorError::failure(e.to_string()))?;
        Ok(json!({"globalCounter": next}))
    }
}

/// Always fails.
struct AlwaysFails;

#[async_trait]
impl Executor for AlwaysFails {
    fn category(&self) -> &str {
        "fails"
    }

    async fn execute(&self, _node: &Node, _input: Value, _ctx: &ExecutionContext) -> ExecResult {
        Err(ExecutorError::failure("intentional failure"))
    }
}

fn registry() -> Arc<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(Emit));
    registry.register(Arc::new(Passthrough));
    registry.register(Arc::new(ConditionIf));
    registry.register(Arc::new(SwitchCase));
    registry.register(Arc::new(Doubler));
    registry.register(Arc::new(DivideBy5));
    registry.register(Arc::new(Counter));
    registry.register(Arc::new(AlwaysFails));
    Arc::new(registry)
}

fn engine(workflow: Workflow) -> Engine {
    Engine::new(workflow, registry(), Arc::new(InMemoryRunStore::new())).unwrap()
}

/// Project the `v` field out of a list output.
fn v_values(output: &Value) -> Vec<i64> {
    output
        .as_array()
        .expect("list output")
        .iter()
        .map(|item| item["v"].as_i64().expect("numeric v"))
        .collect()
}

// ---------------------------------------------------------------------------
// S1 - If routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_if_routing_partitions_items() {
    let workflow = Workflow::new(
        "wf-s1",
        vec![
            node(
                "start",
                "Emit",
                "emit",
                json!({"payload": [{"value": 7}, {"value": 3}]}),
            ),
            node(
                "if1",
                "If",
                "logic",
                json!({"field": "value", "operator": "gt", "value": 5}),
            ),
            node("trueNode", "Collect", "passthrough", json!({})),
            node("falseNode", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("e1", "start", "if1", None),
            edge("e2", "if1", "trueNode", Some("true")),
            edge("e3", "if1", "falseNode", Some("false")),
        ],
    );

    let outcome = engine(workflow).run(None).await;
    assert!(outcome.success, "{:?}", outcome.error);
    let result = outcome.result.unwrap();
    assert_eq!(result["trueNode"], json!([{"value": 7}]));
    assert_eq!(result["falseNode"], json!([{"value": 3}]));
}

/// Branch exclusivity for a plain boolean result: exactly one branch
/// fires.
#[tokio::test]
async fn test_if_boolean_result_fires_one_branch() {
    let workflow = Workflow::new(
        "wf-bool",
        vec![
            node("start", "Emit", "emit", json!({"payload": {"value": 7}})),
            node(
                "if1",
                "If",
                "logic",
                json!({"field": "value", "operator": "gt", "value": 5}),
            ),
            node("trueNode", "Collect", "passthrough", json!({})),
            node("falseNode", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("e1", "start", "if1", None),
            edge("e2", "if1", "trueNode", Some("true")),
            edge("e3", "if1", "falseNode", Some("false")),
        ],
    );

    let outcome = engine(workflow).run(None).await;
    assert!(outcome.success);
    let result = outcome.result.unwrap();
    assert_eq!(result["trueNode"], json!(true));
    assert!(!result.contains_key("falseNode"));
}

// ---------------------------------------------------------------------------
// S2 - Loop batched aggregation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_loop_batched_aggregation() {
    let workflow = Workflow::new(
        "wf-s2",
        vec![
            node("loop1", "Loop", "loop", json!({"batchSize": 2})),
            node("body", "Collect", "passthrough", json!({})),
            node("final", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("body", "loop1", "body", Some("loop")),
            edge("fb", "body", "loop1", None),
            edge("done", "loop1", "final", Some("done")),
        ],
    );

    let outcome = engine(workflow)
        .run(Some(json!([{"v": 1}, {"v": 2}, {"v": 3}])))
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
    let result = outcome.result.unwrap();

    // All items, once, in order
    assert_eq!(v_values(&result["final"]), vec![1, 2, 3]);

    // Two iterations: batches of size 2 then 1
    let items = result["final"].as_array().unwrap();
    assert_eq!(items[0][LOOP_CONTEXT_KEY]["iterationIndex"], json!(0));
    assert_eq!(items[1][LOOP_CONTEXT_KEY]["iterationIndex"], json!(0));
    assert_eq!(items[2][LOOP_CONTEXT_KEY]["iterationIndex"], json!(1));
    assert_eq!(items[0][LOOP_CONTEXT_KEY]["batchSize"], json!(2));
    assert_eq!(items[2][LOOP_CONTEXT_KEY]["batchSize"], json!(1));
}

// ---------------------------------------------------------------------------
// S3 - Loop feedback with transform
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_loop_feedback_transform() {
    let workflow = Workflow::new(
        "wf-s3",
        vec![
            node("loop1", "Loop", "loop", json!({"batchSize": 1})),
            node("process", "Transform", "double", json!({})),
            node("output", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("body", "loop1", "process", Some("loop")),
            edge("fb", "process", "loop1", None),
            edge("done", "loop1", "output", Some("done")),
        ],
    );

    let outcome = engine(workflow)
        .run(Some(json!([{"v": 1}, {"v": 2}, {"v": 3}])))
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
    let result = outcome.result.unwrap();
    assert_eq!(v_values(&result["output"]), vec![2, 4, 6]);
}

// ---------------------------------------------------------------------------
// S4 - Parallel loop with continueOnError
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parallel_loop_continue_on_error() {
    let workflow = Workflow::new(
        "wf-s4",
        vec![
            node(
                "loop1",
                "Loop",
                "loop",
                json!({"parallel": true, "continueOnError": true}),
            ),
            node("divide", "Transform", "divide", json!({})),
            node("final", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("body", "loop1", "divide", Some("loop")),
            edge("fb", "divide", "loop1", None),
            edge("done", "loop1", "final", Some("done")),
        ],
    );

    let outcome = engine(workflow)
        .run(Some(json!([{"v": 10}, {"v": 20}, {"v": 0}])))
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
    let result = outcome.result.unwrap();

    // The zero item's error arrival was dropped
    assert_eq!(v_values(&result["final"]), vec![2, 4]);

    // Processed items carry their loop context
    for item in result["final"].as_array().unwrap() {
        assert!(item.get(LOOP_CONTEXT_KEY).is_some());
    }
}

/// The same failure without continueOnError fails the run.
#[tokio::test]
async fn test_loop_error_fails_strict_run() {
    let workflow = Workflow::new(
        "wf-strict",
        vec![
            node("loop1", "Loop", "loop", json!({})),
            node("divide", "Transform", "divide", json!({})),
            node("final", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("body", "loop1", "divide", Some("loop")),
            edge("fb", "divide", "loop1", None),
            edge("done", "loop1", "final", Some("done")),
        ],
    );

    let outcome = engine(workflow).run(Some(json!([{"v": 0}]))).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("iteration 0"));
}

// ---------------------------------------------------------------------------
// S5 - Switch routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_switch_routing_fires_matching_case_only() {
    let workflow = Workflow::new(
        "wf-s5",
        vec![
            node("switch", "Switch", "switch", json!({"result": "caseB"})),
            node("a", "Collect", "passthrough", json!({})),
            node("b", "Collect", "passthrough", json!({})),
            node("d", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("e1", "switch", "a", Some("caseA")),
            edge("e2", "switch", "b", Some("caseB")),
            edge("e3", "switch", "d", Some("default")),
        ],
    );

    let outcome = engine(workflow).run(None).await;
    assert!(outcome.success);
    let result = outcome.result.unwrap();
    assert!(result.contains_key("b"));
    assert!(!result.contains_key("a"));
    assert!(!result.contains_key("d"));
}

// ---------------------------------------------------------------------------
// S6 - Persistent counter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_persistent_counter_survives_runs() {
    let run_store = Arc::new(InMemoryRunStore::new());
    let workflow = Workflow::new(
        "wf-s6",
        vec![node(
            "pc",
            "Edit Fields",
            "counter",
            json!({"persistent": true}),
        )],
        vec![],
    );

    let first = Engine::new(workflow.clone(), registry(), run_store.clone())
        .unwrap()
        .run(None)
        .await;
    assert!(first.success);
    assert_eq!(first.result.unwrap()["pc"]["globalCounter"], json!(1));

    // A fresh engine instance over the same store sees the counter
    let second = Engine::new(workflow, registry(), run_store.clone())
        .unwrap()
        .run(None)
        .await;
    assert!(second.success);
    assert_eq!(second.result.unwrap()["pc"]["globalCounter"], json!(2));
}

// ---------------------------------------------------------------------------
// Failure modes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unsupported_category_fails_run() {
    let workflow = Workflow::new(
        "wf-unsupported",
        vec![node("mystery", "Custom", "unregistered", json!({}))],
        vec![],
    );

    let outcome = engine(workflow).run(None).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("unregistered"));
}

#[tokio::test]
async fn test_top_level_failure_fails_run() {
    let workflow = Workflow::new(
        "wf-fail",
        vec![
            node("boom", "Custom", "fails", json!({})),
            node("after", "Collect", "passthrough", json!({})),
        ],
        vec![edge("e1", "boom", "after", None)],
    );

    let outcome = engine(workflow).run(None).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("intentional failure"));
}

#[tokio::test]
async fn test_cancellation_before_first_tick() {
    let workflow = Workflow::new(
        "wf-cancel",
        vec![node("start", "Emit", "emit", json!({"payload": 1}))],
        vec![],
    );
    let engine = engine(workflow);
    let token: CancelToken = engine.cancel_token();
    token.cancel();

    let outcome = engine.run(None).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().to_lowercase().contains("cancel"));
}

// ---------------------------------------------------------------------------
// Template resolution through the engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parameters_resolve_against_upstream_output() {
    // `emitter` produces {"x": 41}; `reader` emits its own resolved
    // `payload` parameter, which references the emitter by display name.
    let mut emitter = node("emitter", "Emit", "emit", json!({"payload": {"x": 41}}));
    emitter.name = Some("Source".to_string());
    let workflow = Workflow::new(
        "wf-template",
        vec![
            emitter,
            node(
                "reader",
                "Emit",
                "emit",
                json!({"payload": "{{ $('Source').json.x }}"}),
            ),
        ],
        vec![edge("e1", "emitter", "reader", None)],
    );

    let outcome = engine(workflow).run(None).await;
    assert!(outcome.success, "{:?}", outcome.error);
    let result = outcome.result.unwrap();
    assert_eq!(result["reader"], json!(41));
}

#[tokio::test]
async fn test_missing_template_path_resolves_empty() {
    let workflow = Workflow::new(
        "wf-template-missing",
        vec![node(
            "reader",
            "Emit",
            "emit",
            json!({"payload": "{{ $('Ghost').json.x }}"}),
        )],
        vec![],
    );

    let outcome = engine(workflow).run(None).await;
    assert!(outcome.success);
    assert_eq!(outcome.result.unwrap()["reader"], json!(""));
}

// ---------------------------------------------------------------------------
// Loop edge cases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_loop_fires_done_with_empty_aggregate() {
    let workflow = Workflow::new(
        "wf-empty-loop",
        vec![
            node("loop1", "Loop", "loop", json!({})),
            node("body", "Collect", "passthrough", json!({})),
            node("final", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("body", "loop1", "body", Some("loop")),
            edge("fb", "body", "loop1", None),
            edge("done", "loop1", "final", Some("done")),
        ],
    );

    let outcome = engine(workflow).run(Some(json!([]))).await;
    assert!(outcome.success, "{:?}", outcome.error);
    let result = outcome.result.unwrap();
    assert_eq!(result["final"], json!([]));
    // The body never ran
    assert!(!result.contains_key("body"));
}

#[tokio::test]
async fn test_batch_larger_than_items_is_one_iteration() {
    let workflow = Workflow::new(
        "wf-short-batch",
        vec![
            node("loop1", "Loop", "loop", json!({"batchSize": 10})),
            node("body", "Collect", "passthrough", json!({})),
            node("final", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("body", "loop1", "body", Some("loop")),
            edge("fb", "body", "loop1", None),
            edge("done", "loop1", "final", Some("done")),
        ],
    );

    let outcome = engine(workflow)
        .run(Some(json!([{"v": 1}, {"v": 2}])))
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
    let result = outcome.result.unwrap();
    assert_eq!(v_values(&result["final"]), vec![1, 2]);
    let items = result["final"].as_array().unwrap();
    assert_eq!(items[1][LOOP_CONTEXT_KEY]["iterationIndex"], json!(0));
}

/// A mid-graph loop starts from an upstream node's payload (cold
/// activation) and still buffers body feedback.
#[tokio::test]
async fn test_mid_graph_loop_activation() {
    let workflow = Workflow::new(
        "wf-mid-loop",
        vec![
            node(
                "start",
                "Emit",
                "emit",
                json!({"payload": {"items": [{"v": 2}, {"v": 4}]}}),
            ),
            node("loop1", "Loop", "loop", json!({})),
            node("process", "Transform", "double", json!({})),
            node("final", "Collect", "passthrough", json!({})),
        ],
        vec![
            edge("e1", "start", "loop1", None),
            edge("body", "loop1", "process", Some("loop")),
            edge("fb", "process", "loop1", None),
            edge("done", "loop1", "final", Some("done")),
        ],
    );

    let outcome = engine(workflow).run(None).await;
    assert!(outcome.success, "{:?}", outcome.error);
    let result = outcome.result.unwrap();
    assert_eq!(v_values(&result["final"]), vec![4, 8]);
}
