//! HTTP request operator
//!
//! [`HttpExecutor`] serves the `http` category: it issues one request per
//! `HttpRequest` node from the resolved `url` / `method` / `headers` /
//! `body` parameters and outputs `{"status": ..., "body": ...}`. When the
//! node names a `credential`, the decrypted map is fetched through the
//! [`CredentialStore`] capability and a `token` entry becomes a bearer
//! Authorization header; the scheduler core never sees the secret.

use async_trait::async_trait;
use nodeflow_core::{ExecResult, ExecutionContext, Executor, ExecutorError, Node};
use nodeflow_runstore::CredentialStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Node type handled by this executor.
pub const TYPE_HTTP_REQUEST: &str = "HttpRequest";

/// Executor for `HttpRequest` nodes.
pub struct HttpExecutor {
    client: reqwest::Client,
    credentials: Option<Arc<dyn CredentialStore>>,
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpExecutor {
    /// Create an executor with a default client and no credential store.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            credentials: None,
        }
    }

    /// Attach a credential store for nodes that name a `credential`.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    async fn bearer_token(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
    ) -> Result<Option<String>, ExecutorError> {
        let Some(name) = node.values.get("credential").and_then(Value::as_str) else {
            return Ok(None);
        };
        let Some(store) = &self.credentials else {
            return Err(ExecutorError::invalid_parameter(
                "node names a credential but no credential store is configured",
            ));
        };
        let credential = store
            .get(&ctx.user_id, "http", name)
            .await
            .map_err(|e| ExecutorError::failure(e.to_string()))?
            .ok_or_else(|| {
                ExecutorError::invalid_parameter(format!("credential '{name}' not found"))
            })?;
        Ok(credential
            .get("token")
            .and_then(Value::as_str)
            .map(String::from))
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn category(&self) -> &str {
        "http"
    }

    async fn execute(&self, node: &Node, _input: Value, ctx: &ExecutionContext) -> ExecResult {
        let url = node
            .values
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::invalid_parameter("missing 'url'"))?;
        let method = node
            .values
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| ExecutorError::invalid_parameter(format!("invalid method '{method}'")))?;

        let mut request = self.client.request(method, url);
        if let Some(Value::Object(headers)) = node.values.get("headers") {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(name.as_str(), value);
            }
        }
        if let Some(token) = self.bearer_token(node, ctx).await? {
            request = request.bearer_auth(token);
        }
        if let Some(body) = node.values.get("body") {
            request = request.json(body);
        }

        debug!(node = %node.id, url, "issuing http request");
        let response = request
            .send()
            .await
            .map_err(|e| ExecutorError::failure(format!("request failed: {e}")))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutorError::failure(format!("reading response failed: {e}")))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(json!({ "status": status, "body": body }))
    }
}
