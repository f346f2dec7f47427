use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use chrono::Utc;
use tracing::info;

use super::super::AppState;
use super::super::envelope::{ApiError, ApiResponse, ApiResult, parse_body};
use crate::core::agent::IntervalPolicy;
use crate::core::status::AgentLease;

pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";

pub async fn list_controllers(State(state): State<AppState>) -> ApiResult {
    let now = Utc::now();
    let agents: Vec<_> = state
        .stores
        .status
        .list()
        .await?
        .into_iter()
        .map(|a| a.observed(now))
        .collect();
    Ok(ApiResponse::ok(agents))
}

pub async fn get_controller(Path(name): Path<String>, State(state): State<AppState>) -> ApiResult {
    match state.stores.status.get(&name).await? {
        Some(agent) => Ok(ApiResponse::ok(agent.observed(Utc::now()))),
        None => Err(ApiError::not_found(format!("agent '{}' not found", name))),
    }
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterRequest {
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

/// Claims a status record for an externally run agent. Registering an
/// existing external name rotates its lease; names owned by this daemon's
/// own agents are refused.
pub async fn register_agent(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let payload: RegisterRequest = parse_body(&body)?;
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    if payload.capabilities.iter().any(|c| c.trim().is_empty()) {
        return Err(ApiError::bad_request("capabilities must not contain empty entries"));
    }
    if state.orchestrator.executor_names().contains(&name) {
        return Err(ApiError::conflict(format!(
            "agent '{}' is run by this daemon and cannot be registered",
            name
        )));
    }

    let (lease, status) = state
        .stores
        .status
        .claim(&name, &payload.capabilities, IntervalPolicy::default().initial())
        .await?;
    info!("[{}] Registered via API ({} capabilities)", name, status.capabilities.len());
    Ok(ApiResponse::created(serde_json::json!({
        "name": lease.name,
        "token": lease.token,
    })))
}

pub async fn agent_heartbeat(
    Path(name): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult {
    let token = headers
        .get(AGENT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized(format!("missing {} header", AGENT_TOKEN_HEADER)))?;
    let lease = AgentLease {
        name,
        token: token.to_string(),
    };
    let now = Utc::now();
    let status = state.stores.status.heartbeat(&lease, now).await?;
    Ok(ApiResponse::ok(status.observed(now)))
}
