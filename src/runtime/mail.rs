/// Outbound mail delivery used by the email node

use crate::error::NodeError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

/// A single outgoing message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// Delivers mail; returns the provider's message id
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<String, NodeError>;
}

/// Transport used when no relay is configured; every send fails, which makes
/// the email node fall back to a simulated send
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTransport;

#[async_trait]
impl MailTransport for DisabledTransport {
    async fn send(&self, _message: &MailMessage) -> Result<String, NodeError> {
        Err(NodeError::Transport("no mail transport configured".to_string()))
    }
}

/// Posts messages as JSON to an HTTP mail relay
///
/// Request body: `{ "to", "subject", "text" }`. A 2xx response is a
/// successful send; the message id is read from `messageId` or `id` in the
/// response body, if present.
#[derive(Debug, Clone)]
pub struct HttpMailTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMailTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, message: &MailMessage) -> Result<String, NodeError> {
        tracing::debug!("📧 Posting mail to relay {} for {}", self.endpoint, message.to);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!(message))
            .send()
            .await
            .map_err(|e| NodeError::Transport(format!("mail relay unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::Transport(format!(
                "mail relay rejected message with status {status}"
            )));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message_id = body
            .get("messageId")
            .or_else(|| body.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(message_id)
    }
}
