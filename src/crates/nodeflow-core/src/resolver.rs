//! Template resolution for node parameters
//!
//! Node parameters may embed `{{ ... }}` templates that are resolved once
//! per node execution, before the executor is dispatched. Two forms are
//! supported:
//!
//! - `{{ $('Node Name').json.path.to.field }}` - a dotted path into an
//!   upstream node's output, looked up by display name or node id
//! - `{{ path.to.field }}` - a dotted path into the current work item's
//!   input (the first item, when the input is a list)
//!
//! A template that spans the whole parameter string replaces it with the
//! raw resolved value; templates embedded in a larger string are
//! stringified in place. Missing paths resolve to the empty string, never
//! an error. Resolution is strictly property lookup - no arithmetic, no
//! code evaluation.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// What a template resolves against: the current input and the upstream
/// output map (keyed by node id and display name).
#[derive(Debug, Clone, Copy)]
pub struct ResolveScope<'a> {
    /// Current work item input, if any
    pub input: Option<&'a Value>,
    /// Upstream node outputs
    pub outputs: &'a HashMap<String, Value>,
}

/// Resolves `{{ ... }}` templates in parameter values.
#[derive(Debug, Clone)]
pub struct ReferenceResolver {
    template: Regex,
    node_ref: Regex,
}

impl Default for ReferenceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceResolver {
    /// Build a resolver. The patterns are static; compilation cannot fail.
    pub fn new() -> Self {
        Self {
            template: Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid template pattern"),
            node_ref: Regex::new(r#"^\$\(\s*['"]([^'"]+)['"]\s*\)\.json(?:\.(.+))?$"#)
                .expect("valid node reference pattern"),
        }
    }

    /// Resolve every string leaf of a parameter map.
    pub fn resolve_params(
        &self,
        values: &serde_json::Map<String, Value>,
        scope: ResolveScope<'_>,
    ) -> serde_json::Map<String, Value> {
        values
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v, scope)))
            .collect()
    }

    /// Deeply resolve a value: strings are resolved, lists and mappings
    /// are traversed, everything else passes through.
    pub fn resolve_value(&self, value: &Value, scope: ResolveScope<'_>) -> Value {
        match value {
            Value::String(s) => self.resolve_string(s, scope),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, scope))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, scope)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve one string. When the trimmed string is exactly one
    /// template, the raw resolved value replaces it; otherwise every
    /// template is stringified in place.
    pub fn resolve_string(&self, s: &str, scope: ResolveScope<'_>) -> Value {
        let trimmed = s.trim();
        if let Some(m) = self.template.find(trimmed) {
            if m.start() == 0 && m.end() == trimmed.len() {
                let expr = &self.template.captures(trimmed).expect("just matched")[1];
                return match self.evaluate(expr, scope) {
                    Value::Null => Value::String(String::new()),
                    value => value,
                };
            }
        } else {
            return Value::String(s.to_string());
        }

        let replaced = self.template.replace_all(s, |caps: &regex::Captures<'_>| {
            stringify(&self.evaluate(&caps[1], scope))
        });
        Value::String(replaced.into_owned())
    }

    fn evaluate(&self, expr: &str, scope: ResolveScope<'_>) -> Value {
        if let Some(caps) = self.node_ref.captures(expr) {
            let root = match scope.outputs.get(&caps[1]) {
                Some(output) => output,
                None => return Value::Null,
            };
            return match caps.get(2) {
                Some(path) => path_get(root, path.as_str()),
                None => root.clone(),
            };
        }

        // Input-relative path; a list input resolves against its first
        // item.
        let root = match scope.input {
            Some(Value::Array(items)) => match items.first() {
                Some(first) => first,
                None => return Value::Null,
            },
            Some(value) => value,
            None => return Value::Null,
        };
        path_get(root, expr)
    }
}

/// Dotted-path lookup; numeric segments index into lists. Missing paths
/// yield `Null`.
fn path_get(root: &Value, path: &str) -> Value {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(value) => value,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i))
            {
                Some(value) => value,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
