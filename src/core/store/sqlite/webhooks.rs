use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};

use super::{SqliteStore, decode_opt_ts, decode_ts, encode_ts};
use crate::core::store::StoreError;
use crate::core::webhook::{
    DeliveryStats, DeliveryStatus, Webhook, WebhookDelivery, WebhookEvent, WebhookStore,
};

const WEBHOOK_COLUMNS: &str = "id, url, events, secret, active, rate_limit, created_at";

struct WebhookRow {
    id: String,
    url: String,
    events: String,
    secret: String,
    active: bool,
    rate_limit: i64,
    created_at: String,
}

impl WebhookRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            url: row.get(1)?,
            events: row.get(2)?,
            secret: row.get(3)?,
            active: row.get::<_, i64>(4)? != 0,
            rate_limit: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_webhook(self) -> Result<Webhook, StoreError> {
        let rate_limit = u32::try_from(self.rate_limit).map_err(|_| {
            StoreError::Corrupt(format!("webhook {} rate_limit {}", self.id, self.rate_limit))
        })?;
        Ok(Webhook {
            id: self.id,
            url: self.url,
            events: serde_json::from_str(&self.events)?,
            secret: self.secret,
            active: self.active,
            rate_limit,
            created_at: decode_ts(&self.created_at)?,
        })
    }
}

struct DeliveryRow {
    id: String,
    webhook_id: String,
    event: String,
    status: String,
    status_code: Option<i64>,
    attempts: i64,
    error: Option<String>,
    created_at: String,
    delivered_at: Option<String>,
}

impl DeliveryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            webhook_id: row.get(1)?,
            event: row.get(2)?,
            status: row.get(3)?,
            status_code: row.get(4)?,
            attempts: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            delivered_at: row.get(8)?,
        })
    }

    fn into_delivery(self) -> Result<WebhookDelivery, StoreError> {
        let event = WebhookEvent::from_name(&self.event)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown event '{}'", self.event)))?;
        let status = DeliveryStatus::from_name(&self.status).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown delivery status '{}'", self.status))
        })?;
        let status_code = self
            .status_code
            .map(u16::try_from)
            .transpose()
            .map_err(|_| StoreError::Corrupt(format!("delivery {} status code", self.id)))?;
        Ok(WebhookDelivery {
            id: self.id,
            webhook_id: self.webhook_id,
            event,
            status,
            status_code,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            error: self.error,
            created_at: decode_ts(&self.created_at)?,
            delivered_at: decode_opt_ts(self.delivered_at)?,
        })
    }
}

#[async_trait]
impl WebhookStore for SqliteStore {
    async fn insert(&self, webhook: &Webhook) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let inserted = db.execute(
            "INSERT OR IGNORE INTO webhooks (id, url, events, secret, active, rate_limit, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                webhook.id,
                webhook.url,
                serde_json::to_string(&webhook.events)?,
                webhook.secret,
                webhook.active as i64,
                webhook.rate_limit as i64,
                encode_ts(webhook.created_at),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "webhook {} already exists",
                webhook.id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Webhook>, StoreError> {
        let db = self.db.lock().await;
        db.query_row(
            &format!("SELECT {} FROM webhooks WHERE id = ?1", WEBHOOK_COLUMNS),
            params![id],
            WebhookRow::from_row,
        )
        .optional()?
        .map(WebhookRow::into_webhook)
        .transpose()
    }

    async fn list(&self) -> Result<Vec<Webhook>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM webhooks ORDER BY created_at ASC",
            WEBHOOK_COLUMNS
        ))?;
        let rows = stmt.query_map([], WebhookRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_webhook()?);
        }
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let rows = tx.execute("DELETE FROM webhooks WHERE id = ?1", params![id])?;
        if rows > 0 {
            tx.execute(
                "DELETE FROM webhook_deliveries WHERE webhook_id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(rows > 0)
    }

    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO webhook_deliveries
             (id, webhook_id, event, status, status_code, attempts, error, created_at, delivered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                delivery.id,
                delivery.webhook_id,
                delivery.event.as_str(),
                delivery.status.as_str(),
                delivery.status_code.map(i64::from),
                i64::from(delivery.attempts),
                delivery.error,
                encode_ts(delivery.created_at),
                delivery.delivered_at.map(encode_ts),
            ],
        )?;
        Ok(())
    }

    async fn deliveries(
        &self,
        webhook_id: &str,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, webhook_id, event, status, status_code, attempts, error, created_at, delivered_at
             FROM webhook_deliveries WHERE webhook_id = ?1
             ORDER BY seq DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![webhook_id, limit], DeliveryRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_delivery()?);
        }
        Ok(out)
    }

    async fn delivery_stats(&self) -> Result<DeliveryStats, StoreError> {
        let db = self.db.lock().await;
        let (total, active): (i64, i64) = db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(active), 0) FROM webhooks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut stats = DeliveryStats {
            total_webhooks: usize::try_from(total).unwrap_or(0),
            active_webhooks: usize::try_from(active).unwrap_or(0),
            ..Default::default()
        };
        let mut stmt =
            db.prepare("SELECT status, COUNT(*) FROM webhook_deliveries GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let count = u64::try_from(count).unwrap_or(0);
            match DeliveryStatus::from_name(&status) {
                Some(DeliveryStatus::Success) => stats.deliveries.success += count,
                Some(DeliveryStatus::Failed) => stats.deliveries.failed += count,
                Some(DeliveryStatus::RateLimited) => stats.deliveries.rate_limited += count,
                None => {
                    return Err(StoreError::Corrupt(format!(
                        "unknown delivery status '{}'",
                        status
                    )));
                }
            }
        }
        Ok(stats)
    }
}
