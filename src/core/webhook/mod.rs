mod dispatcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::core::store::StoreError;

pub use dispatcher::{DeliveryConfig, RateLimiter, WebhookDispatcher, WebhookSender};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const EVENT_HEADER: &str = "x-webhook-event";

/// Deliveries per minute when a registration does not set `rate_limit`.
pub const DEFAULT_RATE_LIMIT: u32 = 100;

fn default_rate_limit() -> u32 {
    DEFAULT_RATE_LIMIT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
}

impl WebhookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEvent::TaskCompleted => "task.completed",
            WebhookEvent::TaskFailed => "task.failed",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "task.completed" => Some(WebhookEvent::TaskCompleted),
            "task.failed" => Some(WebhookEvent::TaskFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    pub events: Vec<WebhookEvent>,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub secret: String,
    pub active: bool,
    /// Deliveries allowed per sliding minute; extra events are skipped.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Success,
    Failed,
    RateLimited,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::RateLimited => "rate_limited",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "success" => Some(DeliveryStatus::Success),
            "failed" => Some(DeliveryStatus::Failed),
            "rate_limited" => Some(DeliveryStatus::RateLimited),
            _ => None,
        }
    }
}

/// Outcome of one event sent (or skipped) for one webhook.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub webhook_id: String,
    pub event: WebhookEvent,
    pub status: DeliveryStatus,
    /// HTTP status of the last attempt, if any response arrived.
    pub status_code: Option<u16>,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeliveryCounts {
    pub success: u64,
    pub failed: u64,
    pub rate_limited: u64,
}

impl DeliveryCounts {
    pub fn add(&mut self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Success => self.success += 1,
            DeliveryStatus::Failed => self.failed += 1,
            DeliveryStatus::RateLimited => self.rate_limited += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeliveryStats {
    pub total_webhooks: usize,
    pub active_webhooks: usize,
    pub deliveries: DeliveryCounts,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebhookValidationError {
    #[error("invalid webhook URL: {0}")]
    InvalidUrl(String),
    #[error("at least one event type is required")]
    NoEvents,
    #[error("unknown event type '{0}' (expected task.completed or task.failed)")]
    UnknownEvent(String),
    #[error("rate_limit must be at least 1 delivery per minute")]
    ZeroRateLimit,
}

impl Webhook {
    /// Validates the registration and generates a secret when none is supplied.
    pub fn register(
        url: &str,
        events: &[String],
        secret: Option<String>,
    ) -> Result<Self, WebhookValidationError> {
        let parsed =
            url::Url::parse(url).map_err(|_| WebhookValidationError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(WebhookValidationError::InvalidUrl(url.to_string()));
        }
        if events.is_empty() {
            return Err(WebhookValidationError::NoEvents);
        }
        let mut subscribed = Vec::new();
        for name in events {
            let event = WebhookEvent::from_name(name)
                .ok_or_else(|| WebhookValidationError::UnknownEvent(name.clone()))?;
            if !subscribed.contains(&event) {
                subscribed.push(event);
            }
        }
        let secret = secret
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(generate_secret);
        Ok(Self {
            id: format!("wh_{}", uuid::Uuid::new_v4().simple()),
            url: url.to_string(),
            events: subscribed,
            secret,
            active: true,
            rate_limit: DEFAULT_RATE_LIMIT,
            created_at: Utc::now(),
        })
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Result<Self, WebhookValidationError> {
        if per_minute == 0 {
            return Err(WebhookValidationError::ZeroRateLimit);
        }
        self.rate_limit = per_minute;
        Ok(self)
    }

    pub fn subscribes_to(&self, event: WebhookEvent) -> bool {
        self.active && self.events.contains(&event)
    }
}

fn generate_secret() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// `sha256=<hex>` HMAC of the exact request body.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Receiver-side check, constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let expected = sign_payload(secret, body);
    constant_time_eq(expected.as_bytes(), header.as_bytes())
}

/// Byte comparison whose timing does not depend on where inputs differ.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert(&self, webhook: &Webhook) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Webhook>, StoreError>;

    async fn list(&self) -> Result<Vec<Webhook>, StoreError>;

    /// Also drops the webhook's delivery records.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;

    /// Newest first.
    async fn deliveries(
        &self,
        webhook_id: &str,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    async fn delivery_stats(&self) -> Result<DeliveryStats, StoreError>;

    async fn subscribers(&self, event: WebhookEvent) -> Result<Vec<Webhook>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|w| w.subscribes_to(event))
            .collect())
    }
}
