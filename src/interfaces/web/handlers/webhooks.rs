use axum::{
    body::Bytes,
    extract::{Path, Query, State},
};
use std::collections::HashMap;
use tracing::info;

use super::super::AppState;
use super::super::envelope::{ApiError, ApiResponse, ApiResult, parse_body};
use crate::core::webhook::Webhook;

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateWebhookRequest {
    url: String,
    events: Vec<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    rate_limit: Option<u32>,
}

const DEFAULT_DELIVERY_LIMIT: usize = 50;

/// The secret is only ever returned here.
pub async fn create_webhook(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let payload: CreateWebhookRequest = parse_body(&body)?;
    let mut webhook = Webhook::register(payload.url.trim(), &payload.events, payload.secret)?;
    if let Some(per_minute) = payload.rate_limit {
        webhook = webhook.with_rate_limit(per_minute)?;
    }
    state.stores.webhooks.insert(&webhook).await?;
    info!("Webhook {} registered for {}", webhook.id, webhook.url);

    let mut data = serde_json::to_value(&webhook)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    data["secret"] = serde_json::Value::String(webhook.secret.clone());
    Ok(ApiResponse::created(data))
}

pub async fn list_webhooks(State(state): State<AppState>) -> ApiResult {
    Ok(ApiResponse::ok(state.stores.webhooks.list().await?))
}

pub async fn delete_webhook(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult {
    if state.stores.webhooks.delete(&id).await? {
        info!("Webhook {} removed", id);
        Ok(ApiResponse::ok(serde_json::json!({ "id": id, "deleted": true })))
    } else {
        Err(ApiError::not_found(format!("webhook '{}' not found", id)))
    }
}

pub async fn webhook_stats(State(state): State<AppState>) -> ApiResult {
    Ok(ApiResponse::ok(state.stores.webhooks.delivery_stats().await?))
}

/// Newest first; `limit` defaults to 50.
pub async fn list_deliveries(
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> ApiResult {
    let limit = match query.get("limit").filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::bad_request(format!("invalid limit '{}'", raw)))?,
        None => DEFAULT_DELIVERY_LIMIT,
    };
    if state.stores.webhooks.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("webhook '{}' not found", id)));
    }
    Ok(ApiResponse::ok(
        state.stores.webhooks.deliveries(&id, limit).await?,
    ))
}
