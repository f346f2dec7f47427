use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    DeliveryStatus, EVENT_HEADER, SIGNATURE_HEADER, Webhook, WebhookDelivery, WebhookEvent,
    WebhookStore, sign_payload,
};

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub request_timeout: Duration,
    /// Delay before retry `n` is `base_backoff * 2^n`.
    pub base_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            request_timeout: Duration::from_secs(10),
            base_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEvent {
    event: WebhookEvent,
    data: serde_json::Value,
}

/// Cheap handle used by the orchestrator to publish events.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    tx: Option<mpsc::UnboundedSender<PendingEvent>>,
}

impl WebhookSender {
    /// A sender that drops every event, for setups without webhook delivery.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: WebhookEvent, data: serde_json::Value) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(PendingEvent { event, data }).is_err() {
            warn!("Webhook dispatcher is gone, dropping {} event", event.as_str());
        }
    }
}

/// Per-webhook sliding one-minute window of delivery starts.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Records a delivery for `webhook_id` at `now` unless `per_minute`
    /// deliveries already started within the preceding minute.
    pub fn try_acquire(&mut self, webhook_id: &str, per_minute: u32, now: Instant) -> bool {
        let window = self.windows.entry(webhook_id.to_string()).or_default();
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= per_minute as usize {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drops windows for webhooks that are no longer subscribed.
    fn retain(&mut self, live: &[Webhook]) {
        self.windows
            .retain(|id, _| live.iter().any(|hook| &hook.id == id));
    }
}

pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    client: reqwest::Client,
    config: DeliveryConfig,
    rx: mpsc::UnboundedReceiver<PendingEvent>,
    limiter: RateLimiter,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        config: DeliveryConfig,
    ) -> anyhow::Result<(Self, WebhookSender)> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("autopilot-webhook/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                store,
                client,
                config,
                rx,
                limiter: RateLimiter::default(),
            },
            WebhookSender { tx: Some(tx) },
        ))
    }

    /// Fans events out until cancelled. Each delivery runs on its own task so a
    /// slow subscriber never delays the others.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Webhook dispatcher started");
        loop {
            let pending = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(p) => p,
                    None => break,
                },
            };

            let hooks = match self.store.subscribers(pending.event).await {
                Ok(h) => h,
                Err(e) => {
                    error!("Failed to load webhook subscribers: {}", e);
                    continue;
                }
            };
            if hooks.is_empty() {
                debug!("No subscribers for {}", pending.event.as_str());
                continue;
            }
            info!(
                "Emitting '{}' to {} webhook(s)",
                pending.event.as_str(),
                hooks.len()
            );
            if let Ok(all) = self.store.list().await {
                self.limiter.retain(&all);
            }
            for hook in hooks {
                if !self
                    .limiter
                    .try_acquire(&hook.id, hook.rate_limit, Instant::now())
                {
                    warn!(
                        "Webhook {} exceeded {} deliveries/minute, skipping {}",
                        hook.id,
                        hook.rate_limit,
                        pending.event.as_str()
                    );
                    let skipped = WebhookDelivery {
                        id: uuid::Uuid::new_v4().to_string(),
                        webhook_id: hook.id.clone(),
                        event: pending.event,
                        status: DeliveryStatus::RateLimited,
                        status_code: None,
                        attempts: 0,
                        error: Some("rate limit exceeded".into()),
                        created_at: Utc::now(),
                        delivered_at: None,
                    };
                    record(self.store.as_ref(), &skipped).await;
                    continue;
                }
                let store = self.store.clone();
                let client = self.client.clone();
                let config = self.config.clone();
                let pending = pending.clone();
                tokio::spawn(async move {
                    let delivery = deliver(&client, &config, &hook, &pending).await;
                    record(store.as_ref(), &delivery).await;
                });
            }
        }
        info!("Webhook dispatcher stopped");
    }
}

async fn record(store: &dyn WebhookStore, delivery: &WebhookDelivery) {
    if let Err(e) = store.record_delivery(delivery).await {
        error!("Failed to record webhook delivery {}: {}", delivery.id, e);
    }
}

async fn deliver(
    client: &reqwest::Client,
    config: &DeliveryConfig,
    hook: &Webhook,
    pending: &PendingEvent,
) -> WebhookDelivery {
    let mut delivery = WebhookDelivery {
        id: uuid::Uuid::new_v4().to_string(),
        webhook_id: hook.id.clone(),
        event: pending.event,
        status: DeliveryStatus::Failed,
        status_code: None,
        attempts: 0,
        error: None,
        created_at: Utc::now(),
        delivered_at: None,
    };
    let payload = serde_json::json!({
        "id": delivery.id,
        "webhook_id": hook.id,
        "event_type": pending.event.as_str(),
        "timestamp": delivery.created_at.to_rfc3339(),
        "data": pending.data,
    });
    let body = match serde_json::to_vec(&payload) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to encode webhook payload: {}", e);
            delivery.error = Some(e.to_string());
            return delivery;
        }
    };
    let signature = sign_payload(&hook.secret, &body);

    for attempt in 0..config.max_attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(config.base_backoff * 2u32.saturating_pow(attempt)).await;
        }
        delivery.attempts = attempt + 1;
        let result = client
            .post(&hook.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &signature)
            .header(EVENT_HEADER, pending.event.as_str())
            .body(body.clone())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                info!("Webhook {} delivered (attempt {})", hook.id, attempt + 1);
                delivery.status = DeliveryStatus::Success;
                delivery.status_code = Some(resp.status().as_u16());
                delivery.error = None;
                delivery.delivered_at = Some(Utc::now());
                return delivery;
            }
            Ok(resp) => {
                let code = resp.status().as_u16();
                warn!(
                    "Webhook {} delivery failed with HTTP {} (attempt {})",
                    hook.id,
                    code,
                    attempt + 1
                );
                delivery.status_code = Some(code);
                delivery.error = Some(format!("HTTP {}", code));
            }
            Err(e) => {
                warn!(
                    "Webhook {} delivery error: {} (attempt {})",
                    hook.id,
                    e,
                    attempt + 1
                );
                delivery.status_code = None;
                delivery.error = Some(e.to_string());
            }
        }
    }
    error!("Webhook {} delivery failed permanently", hook.id);
    delivery
}
