/// Node execution handlers
///
/// One handler per node type. Handlers are stateless with respect to the run:
/// they read the node config and the run context and return an outcome. The
/// engine is responsible for recording outcomes and writing run logs.

use crate::error::NodeError;
use crate::runtime::expression;
use crate::runtime::mail::{MailMessage, MailTransport};
use crate::workflow::types::{Node, NodeOutcome, NodeType, RunContext};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Delay used by delay nodes without a `delay` config value
pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Node executor that dispatches on node type
///
/// Holds the outbound collaborators (mail transport, HTTP client) shared by
/// every run.
pub struct NodeExecutor {
    /// Mail delivery for email nodes
    mail: Arc<dyn MailTransport>,
    /// Shared HTTP client for http-request nodes
    http: reqwest::Client,
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor").finish_non_exhaustive()
    }
}

impl NodeExecutor {
    /// Create new node executor with the given mail transport
    pub fn new(mail: Arc<dyn MailTransport>) -> Self {
        Self {
            mail,
            http: reqwest::Client::new(),
        }
    }

    /// Replace the HTTP client (timeouts, proxies, ...)
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Execute a single node against the current run context
    pub async fn execute_node(&self, node: &Node, context: &RunContext) -> Result<NodeOutcome, NodeError> {
        tracing::debug!("🚀 Starting node execution: {} (type: {})", node.id, node.node_type.as_str());
        let start_time = std::time::Instant::now();

        let result = match &node.node_type {
            NodeType::Schedule => Ok(self.execute_schedule_node(context)),
            NodeType::Email => self.execute_email_node(node).await,
            NodeType::HttpRequest => self.execute_http_request_node(node).await,
            NodeType::Delay => Ok(self.execute_delay_node(node).await),
            NodeType::Condition => Ok(self.execute_condition_node(node, context)),
            NodeType::Other(name) => {
                tracing::debug!("❔ Unrecognized node type '{}' on node {}, acknowledging", name, node.id);
                Ok(NodeOutcome::success(json!({
                    "message": "Node executed",
                    "type": name,
                })))
            }
        };

        let duration = start_time.elapsed();
        match &result {
            Ok(outcome) => {
                tracing::debug!("✅ Node execution finished: {} in {:?} (success: {})",
                    node.id, duration, outcome.success);
            }
            Err(e) => {
                tracing::error!("❌ Node execution failed: {} in {:?} - Error: {}", node.id, duration, e);
            }
        }

        result
    }

    /// Schedule nodes only report the firing metadata from the trigger payload
    fn execute_schedule_node(&self, context: &RunContext) -> NodeOutcome {
        let timestamp = context
            .trigger_field("scheduledAt")
            .cloned()
            .unwrap_or_else(|| json!(chrono::Utc::now().to_rfc3339()));
        let execution_count = context
            .trigger_field("executionCount")
            .cloned()
            .unwrap_or(Value::Null);

        NodeOutcome::success(json!({
            "timestamp": timestamp,
            "executionCount": execution_count,
        }))
    }

    /// Send an email; transport failures fall back to a simulated send
    ///
    /// Expected config: { "to", "subject", "message" }
    async fn execute_email_node(&self, node: &Node) -> Result<NodeOutcome, NodeError> {
        let to = node.config_str("to").ok_or_else(|| NodeError::missing("to"))?;
        let subject = node.config_str("subject").ok_or_else(|| NodeError::missing("subject"))?;
        let message = node.config_str("message").ok_or_else(|| NodeError::missing("message"))?;

        let mail = MailMessage {
            to: to.to_string(),
            subject: subject.to_string(),
            text: message.to_string(),
        };

        match self.mail.send(&mail).await {
            Ok(message_id) => {
                tracing::info!("📧 Email sent from node {} to {} ({})", node.id, to, message_id);
                Ok(NodeOutcome::success(json!({
                    "messageId": message_id,
                    "to": to,
                    "subject": subject,
                    "simulated": false,
                })))
            }
            Err(e) => {
                tracing::warn!("⚠️ Mail transport failed for node {}, simulating send: {}", node.id, e);
                Ok(NodeOutcome::success(json!({
                    "messageId": format!("simulated-{}", uuid::Uuid::new_v4()),
                    "to": to,
                    "subject": subject,
                    "simulated": true,
                    "transportError": e.to_string(),
                })))
            }
        }
    }

    /// Call an HTTP endpoint
    ///
    /// Expected config: { "url", "method"?, "headers"?, "body"? }. Object and
    /// array bodies are sent as JSON, strings as plain text. A non-2xx
    /// response is an unsuccessful outcome; a network failure is an error.
    async fn execute_http_request_node(&self, node: &Node) -> Result<NodeOutcome, NodeError> {
        let url = node.config_str("url").ok_or_else(|| NodeError::missing("url"))?;
        let method = node.config_str("method").unwrap_or("GET").to_uppercase();
        let headers = node
            .config
            .get("headers")
            .and_then(|h| h.as_object())
            .cloned()
            .unwrap_or_default();

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);

        let mut request_builder = match method.as_str() {
            "GET" => self.http.get(url),
            "POST" => self.http.post(url),
            "PUT" => self.http.put(url),
            "DELETE" => self.http.delete(url),
            "PATCH" => self.http.patch(url),
            "HEAD" => self.http.head(url),
            _ => {
                return Err(NodeError::InvalidConfiguration(format!(
                    "unsupported HTTP method '{method}'"
                )))
            }
        };

        request_builder = request_builder.headers(build_headers(&headers)?);

        match node.config.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => {
                if !has_header(&headers, "content-type") {
                    request_builder = request_builder.header("Content-Type", "text/plain");
                }
                request_builder = request_builder.body(text.clone());
            }
            Some(body) => {
                request_builder = request_builder.json(body);
            }
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| NodeError::Transport(format!("HTTP request to {url} failed: {e}")))?;

        let status = response.status();
        let headers_map: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let body = response
            .text()
            .await
            .map_err(|e| NodeError::Transport(format!("failed to read response body: {e}")))?;

        tracing::info!("📡 HTTP request completed: {} {} (status: {})", method, url, status);

        let data = json!({
            "status": status.as_u16(),
            "headers": headers_map,
            "body": body,
        });

        if status.is_success() {
            Ok(NodeOutcome::success(data))
        } else {
            Ok(NodeOutcome::failure(data, format!("HTTP {} from {}", status.as_u16(), url)))
        }
    }

    /// Suspend the run for `config.delay` milliseconds
    async fn execute_delay_node(&self, node: &Node) -> NodeOutcome {
        let delay_ms = node
            .config
            .get("delay")
            .and_then(|d| d.as_u64().or_else(|| d.as_str().and_then(|s| s.trim().parse().ok())))
            .unwrap_or(DEFAULT_DELAY_MS);

        tracing::debug!("⏳ Delay node {} sleeping for {}ms", node.id, delay_ms);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        NodeOutcome::success(json!({ "delayed": delay_ms }))
    }

    /// Evaluate `config.condition` with the restricted expression language
    ///
    /// Evaluation errors yield `result: false`, never a node failure.
    fn execute_condition_node(&self, node: &Node, context: &RunContext) -> NodeOutcome {
        let Some(condition) = node.config_str("condition") else {
            return NodeOutcome::success(json!({ "result": false }));
        };

        match expression::evaluate_condition(condition, &context.document()) {
            Ok(result) => {
                tracing::debug!("🔀 Condition on node {} evaluated to {}", node.id, result);
                NodeOutcome::success(json!({ "result": result, "condition": condition }))
            }
            Err(e) => {
                tracing::warn!("⚠️ Condition on node {} failed to evaluate: {}", node.id, e);
                NodeOutcome::success(json!({
                    "result": false,
                    "condition": condition,
                    "error": e.to_string(),
                }))
            }
        }
    }
}

/// Convert configured headers, rejecting names or values HTTP cannot carry
fn build_headers(headers: &Map<String, Value>) -> Result<HeaderMap, NodeError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| NodeError::InvalidConfiguration(format!("invalid header name '{key}'")))?;
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let value = HeaderValue::from_str(&text)
            .map_err(|_| NodeError::InvalidConfiguration(format!("invalid value for header '{key}'")))?;
        map.append(name, value);
    }
    Ok(map)
}

fn has_header(headers: &Map<String, Value>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mail::DisabledTransport;
    use async_trait::async_trait;
    use axum::{http::StatusCode, routing::{get, post}, Router};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<MailMessage>>,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, message: &MailMessage) -> Result<String, NodeError> {
            self.sent.lock().await.push(message.clone());
            Ok("msg-1".to_string())
        }
    }

    fn node(node_type: NodeType, config: Value) -> Node {
        Node {
            id: "n1".to_string(),
            node_type,
            label: String::new(),
            config,
        }
    }

    fn executor() -> NodeExecutor {
        NodeExecutor::new(Arc::new(DisabledTransport))
    }

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/ok", get(|| async { "hello" }))
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route("/echo", post(|body: String| async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn schedule_node_reports_trigger_metadata() {
        let ctx = RunContext::new(
            "run",
            json!({ "scheduledAt": "2030-01-01T00:00:00Z", "executionCount": 4 }),
        );
        let outcome = executor()
            .execute_node(&node(NodeType::Schedule, json!({})), &ctx)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.data["timestamp"], "2030-01-01T00:00:00Z");
        assert_eq!(outcome.data["executionCount"], 4);
    }

    #[tokio::test]
    async fn email_requires_all_fields() {
        let ctx = RunContext::default();
        let err = executor()
            .execute_node(&node(NodeType::Email, json!({ "to": "a@b.c", "subject": "s" })), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::MissingConfiguration { ref field } if field == "message"));
    }

    #[tokio::test]
    async fn email_falls_back_to_simulated_send() {
        let ctx = RunContext::default();
        let config = json!({ "to": "a@b.c", "subject": "s", "message": "m" });
        let outcome = executor()
            .execute_node(&node(NodeType::Email, config), &ctx)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.data["simulated"], true);
        assert!(outcome.data["messageId"].as_str().unwrap().starts_with("simulated-"));
    }

    #[tokio::test]
    async fn email_uses_transport_when_available() {
        let transport = Arc::new(RecordingTransport::default());
        let executor = NodeExecutor::new(transport.clone());
        let config = json!({ "to": "a@b.c", "subject": "s", "message": "m" });
        let outcome = executor
            .execute_node(&node(NodeType::Email, config), &RunContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.data["simulated"], false);
        assert_eq!(outcome.data["messageId"], "msg-1");
        assert_eq!(transport.sent.lock().await[0].text, "m");
    }

    #[tokio::test]
    async fn http_request_mirrors_status() {
        let base = spawn_server().await;
        let ctx = RunContext::default();

        let ok = executor()
            .execute_node(&node(NodeType::HttpRequest, json!({ "url": format!("{base}/ok") })), &ctx)
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.data["status"], 200);
        assert_eq!(ok.data["body"], "hello");

        let missing = executor()
            .execute_node(&node(NodeType::HttpRequest, json!({ "url": format!("{base}/missing") })), &ctx)
            .await
            .unwrap();
        assert!(!missing.success);
        assert_eq!(missing.data["status"], 404);
        assert_eq!(missing.data["body"], "nope");
    }

    #[tokio::test]
    async fn http_request_sends_json_body() {
        let base = spawn_server().await;
        let config = json!({
            "url": format!("{base}/echo"),
            "method": "post",
            "body": { "city": "Oslo" }
        });
        let outcome = executor()
            .execute_node(&node(NodeType::HttpRequest, config), &RunContext::default())
            .await
            .unwrap();
        assert!(outcome.success);
        let echoed: Value = serde_json::from_str(outcome.data["body"].as_str().unwrap()).unwrap();
        assert_eq!(echoed["city"], "Oslo");
    }

    #[tokio::test]
    async fn http_network_failure_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = executor()
            .execute_node(
                &node(NodeType::HttpRequest, json!({ "url": format!("http://{addr}/") })),
                &RunContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Transport(_)));

        let err = executor()
            .execute_node(
                &node(NodeType::HttpRequest, json!({ "url": "http://localhost", "method": "TRACE" })),
                &RunContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn malformed_headers_are_configuration_errors() {
        let bad_name = node(
            NodeType::HttpRequest,
            json!({ "url": "http://localhost", "headers": { "bad header": "x" } }),
        );
        let err = executor()
            .execute_node(&bad_name, &RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfiguration(m) if m.contains("bad header")));

        let bad_value = node(
            NodeType::HttpRequest,
            json!({ "url": "http://localhost", "headers": { "X-Token": "line\nbreak" } }),
        );
        let err = executor()
            .execute_node(&bad_value, &RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfiguration(m) if m.contains("X-Token")));
    }

    #[tokio::test]
    async fn delay_waits_for_configured_time() {
        let start = std::time::Instant::now();
        let outcome = executor()
            .execute_node(&node(NodeType::Delay, json!({ "delay": 20 })), &RunContext::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(outcome.data["delayed"], 20);
    }

    #[tokio::test]
    async fn condition_errors_become_false() {
        let mut ctx = RunContext::new("run", json!({ "executionCount": 2 }));
        ctx.record("fetch", NodeOutcome::success(json!({ "status": 200 })));

        let outcome = executor()
            .execute_node(
                &node(NodeType::Condition, json!({ "condition": "fetch.data.status == 200 && trigger.executionCount > 1" })),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(outcome.data["result"], true);

        let broken = executor()
            .execute_node(&node(NodeType::Condition, json!({ "condition": "eval('x') ==" })), &ctx)
            .await
            .unwrap();
        assert!(broken.success);
        assert_eq!(broken.data["result"], false);
        assert!(broken.data["error"].is_string());
    }

    #[tokio::test]
    async fn unknown_types_are_acknowledged() {
        let outcome = executor()
            .execute_node(&node(NodeType::Other("slack".into()), json!({})), &RunContext::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.data["type"], "slack");
    }
}
