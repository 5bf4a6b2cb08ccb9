//! Conditional operators: `If` and `Switch`
//!
//! [`LogicExecutor`] serves the `logic` category. An `If` node partitions
//! a list input into `{"true": [...], "false": [...]}` (the router fires
//! both branches with their slices) or reduces a single input to a plain
//! boolean; a `Switch` node resolves its `value` parameter and returns
//! the matching case name, or `default`.

use async_trait::async_trait;
use nodeflow_core::{
    ExecResult, ExecutionContext, Executor, ExecutorError, Node, HANDLE_DEFAULT, TYPE_IF,
    TYPE_SWITCH,
};
use serde_json::{json, Value};

/// Executor for `If` and `Switch` nodes.
#[derive(Debug, Default)]
pub struct LogicExecutor;

impl LogicExecutor {
    /// Create the executor.
    pub fn new() -> Self {
        Self
    }
}

/// Compare two values under a named operator.
fn compare(lhs: &Value, operator: &str, rhs: &Value) -> Result<bool, ExecutorError> {
    let numeric = |a: &Value, b: &Value| a.as_f64().zip(b.as_f64());
    match operator {
        "equals" => Ok(lhs == rhs),
        "not_equals" => Ok(lhs != rhs),
        "gt" => Ok(numeric(lhs, rhs).is_some_and(|(a, b)| a > b)),
        "gte" => Ok(numeric(lhs, rhs).is_some_and(|(a, b)| a >= b)),
        "lt" => Ok(numeric(lhs, rhs).is_some_and(|(a, b)| a < b)),
        "lte" => Ok(numeric(lhs, rhs).is_some_and(|(a, b)| a <= b)),
        "contains" => Ok(match (lhs, rhs) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        }),
        other => Err(ExecutorError::invalid_parameter(format!(
            "unknown operator '{other}'"
        ))),
    }
}

fn eval_if(node: &Node, input: Value) -> ExecResult {
    let operator = node
        .values
        .get("operator")
        .and_then(Value::as_str)
        .unwrap_or("equals");
    let rhs = node.values.get("value").cloned().unwrap_or(Value::Null);

    // Item-wise mode: a `field` config partitions list inputs and tests
    // single objects by field lookup.
    if let Some(field) = node.values.get("field").and_then(Value::as_str) {
        let test = |item: &Value| {
            let lhs = item.get(field).unwrap_or(&Value::Null);
            compare(lhs, operator, &rhs)
        };
        return match input {
            Value::Array(items) => {
                let mut pass = Vec::new();
                let mut fail = Vec::new();
                for item in items {
                    if test(&item)? {
                        pass.push(item);
                    } else {
                        fail.push(item);
                    }
                }
                Ok(json!({ "true": pass, "false": fail }))
            }
            other => Ok(Value::Bool(test(&other)?)),
        };
    }

    // Expression mode: `left` and `right` were already template-resolved
    // by the engine; compare them once.
    let left = node.values.get("left").cloned().unwrap_or(Value::Null);
    let right = node.values.get("right").cloned().unwrap_or(Value::Null);
    Ok(Value::Bool(compare(&left, operator, &right)?))
}

fn eval_switch(node: &Node) -> ExecResult {
    let value = match node.values.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => return Ok(Value::String(HANDLE_DEFAULT.to_string())),
    };
    let matched = node
        .values
        .get("cases")
        .and_then(Value::as_array)
        .map(|cases| cases.iter().any(|case| case.as_str() == Some(&value)))
        .unwrap_or(false);
    if matched {
        Ok(Value::String(value))
    } else {
        Ok(Value::String(HANDLE_DEFAULT.to_string()))
    }
}

#[async_trait]
impl Executor for LogicExecutor {
    fn category(&self) -> &str {
        "logic"
    }

    async fn execute(&self, node: &Node, input: Value, _ctx: &ExecutionContext) -> ExecResult {
        match node.node_type.as_str() {
            TYPE_IF => eval_if(node, input),
            TYPE_SWITCH => eval_switch(node),
            other => Err(ExecutorError::invalid_parameter(format!(
                "logic executor cannot run node type '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_runstore::{InMemoryRunStore, PersistentState};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "u",
            "wf",
            "run",
            Arc::new(RwLock::new(PersistentState::new())),
            Arc::new(InMemoryRunStore::new()),
        )
    }

    fn node(node_type: &str, values: Value) -> Node {
        Node {
            id: "n1".to_string(),
            name: None,
            node_type: node_type.to_string(),
            category: "logic".to_string(),
            values: values.as_object().cloned().unwrap(),
            data: Default::default(),
            disabled: false,
        }
    }

    #[tokio::test]
    async fn test_if_partitions_list_input() {
        let node = node("If", json!({"field": "v", "operator": "gt", "value": 5}));
        let result = LogicExecutor::new()
            .execute(&node, json!([{"v": 7}, {"v": 3}, {"v": 9}]), &ctx())
            .await
            .unwrap();
        assert_eq!(result["true"], json!([{"v": 7}, {"v": 9}]));
        assert_eq!(result["false"], json!([{"v": 3}]));
    }

    #[tokio::test]
    async fn test_if_single_input_is_boolean() {
        let node = node("If", json!({"field": "v", "operator": "lte", "value": 5}));
        let result = LogicExecutor::new()
            .execute(&node, json!({"v": 5}), &ctx())
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[tokio::test]
    async fn test_if_expression_mode() {
        // left/right arrive pre-resolved from the engine
        let node = node("If", json!({"left": "EURUSD", "operator": "equals", "right": "EURUSD"}));
        let result = LogicExecutor::new()
            .execute(&node, Value::Null, &ctx())
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[tokio::test]
    async fn test_if_contains() {
        let node = node(
            "If",
            json!({"field": "tags", "operator": "contains", "value": "urgent"}),
        );
        let result = LogicExecutor::new()
            .execute(&node, json!({"tags": ["low", "urgent"]}), &ctx())
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[tokio::test]
    async fn test_if_unknown_operator_is_invalid() {
        let node = node("If", json!({"field": "v", "operator": "spaceship", "value": 1}));
        let err = LogicExecutor::new()
            .execute(&node, json!({"v": 1}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_switch_returns_matching_case() {
        let node = node(
            "Switch",
            json!({"value": "caseB", "cases": ["caseA", "caseB"]}),
        );
        let result = LogicExecutor::new()
            .execute(&node, Value::Null, &ctx())
            .await
            .unwrap();
        assert_eq!(result, json!("caseB"));
    }

    #[tokio::test]
    async fn test_switch_falls_back_to_default() {
        let node = node(
            "Switch",
            json!({"value": "caseZ", "cases": ["caseA", "caseB"]}),
        );
        let result = LogicExecutor::new()
            .execute(&node, Value::Null, &ctx())
            .await
            .unwrap();
        assert_eq!(result, json!("default"));
    }
}
