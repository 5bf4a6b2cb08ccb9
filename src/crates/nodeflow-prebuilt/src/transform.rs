//! Data-shaping operators: `Edit Fields` and `Math`
//!
//! [`TransformExecutor`] serves the `transform` category. `Edit Fields`
//! applies a list of field operations (`set`, `increment`) to the input
//! object; with `persistent: true` each field round-trips through the
//! workflow-scoped persistent values, so counters survive run boundaries.
//! `Math` evaluates one arithmetic operation over two resolved operands.

use async_trait::async_trait;
use nodeflow_core::{ExecResult, ExecutionContext, Executor, ExecutorError, Node};
use serde_json::{json, Value};
use tracing::debug;

/// Node type handled by the `Edit Fields` branch.
pub const TYPE_EDIT_FIELDS: &str = "Edit Fields";

/// Node type handled by the `Math` branch.
pub const TYPE_MATH: &str = "Math";

/// Executor for `Edit Fields` and `Math` nodes.
#[derive(Debug, Default)]
pub struct TransformExecutor;

impl TransformExecutor {
    /// Create the executor.
    pub fn new() -> Self {
        Self
    }
}

async fn eval_edit_fields(node: &Node, input: Value, ctx: &ExecutionContext) -> ExecResult {
    let persistent = node
        .values
        .get("persistent")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let fields = node
        .values
        .get("fields")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut output = input.as_object().cloned().unwrap_or_default();

    for field in &fields {
        let Some(name) = field.get("name").and_then(Value::as_str) else {
            return Err(ExecutorError::invalid_parameter("field without a 'name'"));
        };
        let operation = field
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("set");

        let next = match operation {
            "set" => field.get("value").cloned().unwrap_or(Value::Null),
            "increment" => {
                let by = field.get("by").and_then(Value::as_i64).unwrap_or(1);
                let current = if persistent {
                    ctx.get_persistent_value(name).await
                } else {
                    output.get(name).cloned()
                };
                let current = current.and_then(|v| v.as_i64()).unwrap_or(0);
                json!(current + by)
            }
            other => {
                return Err(ExecutorError::invalid_parameter(format!(
                    "unknown field operation '{other}'"
                )))
            }
        };

        if persistent {
            ctx.set_persistent_value(name, next.clone())
                .await
                .map_err(|e| ExecutorError::failure(e.to_string()))?;
            debug!(field = name, "persistent value updated");
        }
        output.insert(name.to_string(), next);
    }

    Ok(Value::Object(output))
}

fn eval_math(node: &Node) -> ExecResult {
    let operand = |key: &str| -> Result<f64, ExecutorError> {
        node.values
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| ExecutorError::invalid_parameter(format!("'{key}' must be a number")))
    };
    let left = operand("left")?;
    let right = operand("right")?;
    let operation = node
        .values
        .get("operation")
        .and_then(Value::as_str)
        .unwrap_or("add");

    let result = match operation {
        "add" => left + right,
        "subtract" => left - right,
        "multiply" => left * right,
        "divide" => {
            if right == 0.0 {
                return Err(ExecutorError::failure("division by zero"));
            }
            left / right
        }
        other => {
            return Err(ExecutorError::invalid_parameter(format!(
                "unknown operation '{other}'"
            )))
        }
    };
    Ok(json!({ "result": result }))
}

#[async_trait]
impl Executor for TransformExecutor {
    fn category(&self) -> &str {
        "transform"
    }

    async fn execute(&self, node: &Node, input: Value, ctx: &ExecutionContext) -> ExecResult {
        match node.node_type.as_str() {
            TYPE_EDIT_FIELDS => eval_edit_fields(node, input, ctx).await,
            TYPE_MATH => eval_math(node),
            other => Err(ExecutorError::invalid_parameter(format!(
                "transform executor cannot run node type '{other}'"
            ))),
        }
    }
}
