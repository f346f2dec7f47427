//! Typed client for the control API.
//!
//! Every method maps to one endpoint and runs under the client's
//! [`RetryPolicy`]: transport failures and 5xx responses are retried with
//! exponential backoff plus jitter, 4xx responses surface immediately as
//! [`ClientError::Api`].

mod error;
mod retry;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub use error::ClientError;
pub use retry::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT, RetryPolicy};

use crate::core::orchestrator::CancelOutcome;
use crate::core::status::AgentStatus;
use crate::core::tasks::{Parameters, Priority, Task, TaskStatus};
use crate::core::webhook::{DeliveryStats, Webhook, WebhookDelivery};
use crate::interfaces::web::AGENT_TOKEN_HEADER;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5005";

/// A decoded success envelope.
#[derive(Debug, Clone)]
pub struct ApiReply<T> {
    pub data: T,
    pub status_code: u16,
    /// Server-side handling time in milliseconds.
    pub response_time: u64,
    /// Requests sent, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    response_time: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Health {
    pub ok: bool,
    pub uptime_secs: u64,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueReport {
    pub parallel_mode: bool,
    pub max_concurrent: usize,
    pub concurrency_limit: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusReport {
    pub agents: Vec<AgentStatus>,
    pub tasks: BTreeMap<String, usize>,
    pub queue: QueueReport,
    #[serde(default)]
    pub executors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelReply {
    pub id: String,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmitTask {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl SubmitTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    policy: RetryPolicy,
}

impl ControlClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| ClientError::Config(format!("invalid API URL '{}': {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::Config(format!(
                "API URL must be http(s): {}",
                base_url
            )));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("autopilot-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            policy: RetryPolicy::default(),
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<ApiReply<Health>, ClientError> {
        self.call(Method::GET, "/health", &[], None, None).await
    }

    pub async fn status(&self) -> Result<ApiReply<StatusReport>, ClientError> {
        self.call(Method::GET, "/status", &[], None, None).await
    }

    pub async fn controllers(&self) -> Result<ApiReply<Vec<AgentStatus>>, ClientError> {
        self.call(Method::GET, "/controllers", &[], None, None).await
    }

    pub async fn controller(&self, name: &str) -> Result<ApiReply<AgentStatus>, ClientError> {
        let path = format!("/controllers/{}", urlencoding::encode(name));
        self.call(Method::GET, &path, &[], None, None).await
    }

    pub async fn register_agent(
        &self,
        name: &str,
        capabilities: &[String],
    ) -> Result<ApiReply<Registration>, ClientError> {
        let body = serde_json::json!({ "name": name, "capabilities": capabilities });
        self.call(Method::POST, "/agents/register", &[], Some(body), None)
            .await
    }

    pub async fn heartbeat(
        &self,
        name: &str,
        agent_token: &str,
    ) -> Result<ApiReply<AgentStatus>, ClientError> {
        let path = format!("/agents/{}/heartbeat", urlencoding::encode(name));
        self.call(Method::POST, &path, &[], None, Some(agent_token))
            .await
    }

    pub async fn submit_task(&self, task: &SubmitTask) -> Result<ApiReply<Task>, ClientError> {
        let body =
            serde_json::to_value(task).map_err(|e| ClientError::Decode(e.to_string()))?;
        self.call(Method::POST, "/tasks/submit", &[], Some(body), None)
            .await
    }

    pub async fn get_task(&self, id: &str) -> Result<ApiReply<Task>, ClientError> {
        let path = format!("/tasks/{}", urlencoding::encode(id));
        self.call(Method::GET, &path, &[], None, None).await
    }

    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<ApiReply<Vec<Task>>, ClientError> {
        let mut params = Vec::new();
        if let Some(status) = query.status {
            params.push(("status", status.as_str().to_string()));
        }
        if let Some(task_type) = &query.task_type {
            params.push(("type", task_type.clone()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        self.call(Method::GET, "/tasks", &params, None, None).await
    }

    pub async fn cancel_task(&self, id: &str) -> Result<ApiReply<CancelReply>, ClientError> {
        let path = format!("/tasks/{}/cancel", urlencoding::encode(id));
        self.call(Method::POST, &path, &[], None, None).await
    }

    /// The returned webhook carries its secret; listings never do.
    pub async fn create_webhook(
        &self,
        url: &str,
        events: &[String],
        secret: Option<&str>,
        rate_limit: Option<u32>,
    ) -> Result<ApiReply<Webhook>, ClientError> {
        let mut body = serde_json::json!({ "url": url, "events": events });
        if let Some(secret) = secret {
            body["secret"] = serde_json::Value::String(secret.to_string());
        }
        if let Some(per_minute) = rate_limit {
            body["rate_limit"] = serde_json::Value::from(per_minute);
        }
        self.call(Method::POST, "/webhooks", &[], Some(body), None)
            .await
    }

    pub async fn list_webhooks(&self) -> Result<ApiReply<Vec<Webhook>>, ClientError> {
        self.call(Method::GET, "/webhooks", &[], None, None).await
    }

    pub async fn delete_webhook(&self, id: &str) -> Result<ApiReply<serde_json::Value>, ClientError> {
        let path = format!("/webhooks/{}", urlencoding::encode(id));
        self.call(Method::DELETE, &path, &[], None, None).await
    }

    pub async fn webhook_stats(&self) -> Result<ApiReply<DeliveryStats>, ClientError> {
        self.call(Method::GET, "/webhooks/stats", &[], None, None).await
    }

    /// Newest first; the server caps an unset `limit` at 50.
    pub async fn webhook_deliveries(
        &self,
        id: &str,
        limit: Option<usize>,
    ) -> Result<ApiReply<Vec<WebhookDelivery>>, ClientError> {
        let path = format!("/webhooks/{}/deliveries", urlencoding::encode(id));
        let params: Vec<(&str, String)> =
            limit.map(|l| ("limit", l.to_string())).into_iter().collect();
        self.call(Method::GET, &path, &params, None, None).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        agent_token: Option<&str>,
    ) -> Result<ApiReply<T>, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;

        loop {
            let sent = attempt + 1;
            let failure = match self
                .send_once(&method, &url, query, body.as_ref(), agent_token)
                .await
            {
                Ok((status, text)) => {
                    match interpret::<T>(status, &text, sent) {
                        Ok(reply) => return Ok(reply),
                        Err(err) if err.is_retryable() => err,
                        Err(err) => return Err(err),
                    }
                }
                Err(e) => classify_transport(&e, sent, self.policy.timeout),
            };

            if sent >= max_attempts {
                warn!("{} {} failed after {} attempt(s): {}", method, path, sent, failure);
                return Err(failure);
            }
            let delay = self.policy.backoff(attempt);
            debug!(
                "{} {} attempt {}/{} failed ({}), retrying in {:?}",
                method, path, sent, max_attempts, failure, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
        agent_token: Option<&str>,
    ) -> Result<(u16, String), reqwest::Error> {
        let mut req = self
            .http
            .request(method.clone(), url)
            .timeout(self.policy.timeout);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(agent_token) = agent_token {
            req = req.header(AGENT_TOKEN_HEADER, agent_token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        Ok((status, text))
    }
}

fn classify_transport(err: &reqwest::Error, attempts: u32, timeout: std::time::Duration) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout { attempts, timeout }
    } else {
        ClientError::Connection {
            attempts,
            message: err.to_string(),
        }
    }
}

fn interpret<T: DeserializeOwned>(
    status: u16,
    text: &str,
    attempts: u32,
) -> Result<ApiReply<T>, ClientError> {
    let envelope = serde_json::from_str::<RawEnvelope>(text).ok();
    let message = || {
        envelope
            .as_ref()
            .and_then(|e| e.error.clone())
            .unwrap_or_else(|| {
                let snippet: String = text.chars().take(200).collect();
                if snippet.is_empty() {
                    format!("HTTP {}", status)
                } else {
                    snippet
                }
            })
    };

    match status {
        500..=599 => Err(ClientError::Server {
            status,
            message: message(),
        }),
        400..=499 => Err(ClientError::Api {
            status,
            message: message(),
        }),
        200..=299 => {
            let envelope = envelope.ok_or_else(|| {
                ClientError::Decode(format!("response is not an API envelope (HTTP {})", status))
            })?;
            let data = envelope.data.unwrap_or(serde_json::Value::Null);
            let data = serde_json::from_value(data)
                .map_err(|e| ClientError::Decode(e.to_string()))?;
            Ok(ApiReply {
                data,
                status_code: status,
                response_time: envelope.response_time.unwrap_or(0),
                attempts,
            })
        }
        other => Err(ClientError::Decode(format!("unexpected HTTP status {}", other))),
    }
}
