use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{StoreError, check_enqueue};
use crate::core::status::{AgentLease, AgentStatus, StatusStore, apply_heartbeat, merge_upsert};
use crate::core::tasks::{
    QueueSettings, Task, TaskFilter, TaskQueue, TaskStatus, TransitionPatch, apply_transition,
    can_transition,
};
use crate::core::webhook::{DeliveryStats, Webhook, WebhookDelivery, WebhookStore};

#[derive(Default)]
struct Inner {
    agents: HashMap<String, (String, AgentStatus)>,
    tasks: HashMap<String, Task>,
    next_seq: u64,
    settings: QueueSettings,
    webhooks: Vec<Webhook>,
    deliveries: Vec<WebhookDelivery>,
}

/// Process-local store used by tests and `storage.backend = "memory"`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: QueueSettings) -> Self {
        Self {
            inner: Mutex::new(Inner {
                settings,
                ..Default::default()
            }),
        }
    }
}

fn check_lease<'a>(
    agents: &'a mut HashMap<String, (String, AgentStatus)>,
    lease: &AgentLease,
) -> Result<&'a mut AgentStatus, StoreError> {
    let (token, status) = agents
        .get_mut(&lease.name)
        .ok_or_else(|| StoreError::NotFound(format!("agent '{}'", lease.name)))?;
    if *token != lease.token {
        return Err(StoreError::NotOwner(lease.name.clone()));
    }
    Ok(status)
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn claim(
        &self,
        name: &str,
        capabilities: &[String],
        initial_interval: Duration,
    ) -> Result<(AgentLease, AgentStatus), StoreError> {
        let mut inner = self.inner.lock().await;
        let lease = AgentLease::issue(name);
        let status = match inner.agents.remove(name) {
            Some((_, mut existing)) => {
                existing.capabilities = capabilities.to_vec();
                existing
            }
            None => AgentStatus::new(name, capabilities.to_vec(), initial_interval),
        };
        inner
            .agents
            .insert(name.to_string(), (lease.token.clone(), status.clone()));
        Ok((lease, status))
    }

    async fn get(&self, name: &str) -> Result<Option<AgentStatus>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.agents.get(name).map(|(_, s)| s.clone()))
    }

    async fn list(&self) -> Result<Vec<AgentStatus>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner.agents.values().map(|(_, s)| s.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn upsert(&self, lease: &AgentLease, status: &AgentStatus) -> Result<(), StoreError> {
        if status.name != lease.name {
            return Err(StoreError::NotOwner(status.name.clone()));
        }
        let mut inner = self.inner.lock().await;
        let stored = check_lease(&mut inner.agents, lease)?;
        let merged = merge_upsert(Some(&*stored), status);
        *stored = merged;
        Ok(())
    }

    async fn heartbeat(
        &self,
        lease: &AgentLease,
        at: DateTime<Utc>,
    ) -> Result<AgentStatus, StoreError> {
        let mut inner = self.inner.lock().await;
        let stored = check_lease(&mut inner.agents, lease)?;
        apply_heartbeat(stored, at);
        Ok(stored.clone())
    }
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn enqueue(&self, mut task: Task) -> Result<Task, StoreError> {
        check_enqueue(&task)?;
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        inner.next_seq += 1;
        task.seq = inner.next_seq;
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(id).cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        out.sort_by(Task::dispatch_order);
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn transition(
        &self,
        id: &str,
        expected: TaskStatus,
        new: TaskStatus,
        patch: TransitionPatch,
    ) -> Result<bool, StoreError> {
        if !can_transition(expected, new) {
            return Err(StoreError::Conflict(format!(
                "illegal transition {} -> {}",
                expected, new
            )));
        }
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        if task.status != expected {
            return Ok(false);
        }
        apply_transition(task, new, patch, Utc::now());
        Ok(true)
    }

    async fn settings(&self) -> Result<QueueSettings, StoreError> {
        Ok(self.inner.lock().await.settings)
    }

    async fn update_settings(&self, settings: QueueSettings) -> Result<(), StoreError> {
        self.inner.lock().await.settings = settings;
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn insert(&self, webhook: &Webhook) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.webhooks.iter().any(|w| w.id == webhook.id) {
            return Err(StoreError::Conflict(format!(
                "webhook {} already exists",
                webhook.id
            )));
        }
        inner.webhooks.push(webhook.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Webhook>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.webhooks.iter().find(|w| w.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<Webhook>, StoreError> {
        Ok(self.inner.lock().await.webhooks.clone())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.webhooks.len();
        inner.webhooks.retain(|w| w.id != id);
        let removed = inner.webhooks.len() != before;
        if removed {
            inner.deliveries.retain(|d| d.webhook_id != id);
        }
        Ok(removed)
    }

    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        self.inner.lock().await.deliveries.push(delivery.clone());
        Ok(())
    }

    async fn deliveries(
        &self,
        webhook_id: &str,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deliveries
            .iter()
            .rev()
            .filter(|d| d.webhook_id == webhook_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delivery_stats(&self) -> Result<DeliveryStats, StoreError> {
        let inner = self.inner.lock().await;
        let mut stats = DeliveryStats {
            total_webhooks: inner.webhooks.len(),
            active_webhooks: inner.webhooks.iter().filter(|w| w.active).count(),
            ..Default::default()
        };
        for delivery in &inner.deliveries {
            stats.deliveries.add(delivery.status);
        }
        Ok(stats)
    }
}
