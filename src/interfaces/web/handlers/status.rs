use axum::extract::State;
use chrono::Utc;
use std::collections::BTreeMap;

use super::super::AppState;
use super::super::envelope::{ApiResponse, ApiResult};
use crate::core::tasks::{TaskFilter, TaskStatus};

pub async fn get_status(State(state): State<AppState>) -> ApiResult {
    let now = Utc::now();
    let agents: Vec<_> = state
        .stores
        .status
        .list()
        .await?
        .into_iter()
        .map(|a| a.observed(now))
        .collect();

    let mut counts: BTreeMap<&'static str, usize> =
        TaskStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for task in state.stores.tasks.list(&TaskFilter::default()).await? {
        *counts.entry(task.status.as_str()).or_default() += 1;
    }
    let settings = state.stores.tasks.settings().await?;

    Ok(ApiResponse::ok(serde_json::json!({
        "agents": agents,
        "tasks": counts,
        "queue": {
            "parallel_mode": settings.parallel_mode,
            "max_concurrent": settings.max_concurrent,
            "concurrency_limit": settings.concurrency_limit(),
            "in_flight": state.orchestrator.in_flight().await,
        },
        "executors": state.orchestrator.executor_names(),
    })))
}

pub async fn get_health(State(state): State<AppState>) -> ApiResult {
    Ok(ApiResponse::ok(serde_json::json!({
        "ok": true,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
