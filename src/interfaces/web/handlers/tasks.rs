use axum::{
    body::Bytes,
    extract::{Path, Query, State},
};
use std::collections::HashMap;
use std::time::Duration;

use super::super::AppState;
use super::super::envelope::{ApiError, ApiResponse, ApiResult, parse_body};
use crate::core::orchestrator::CancelOutcome;
use crate::core::tasks::{MAX_TIMEOUT_SECS, Parameters, Priority, Task, TaskFilter, TaskStatus};

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitRequest {
    #[serde(rename = "type")]
    task_type: Option<String>,
    #[serde(default)]
    target: Option<String>,
    /// Duplicate keys are rejected while deserializing.
    #[serde(default)]
    parameters: Option<Parameters>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    parallel_enabled: Option<bool>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

impl SubmitRequest {
    fn into_task(self) -> Result<Task, ApiError> {
        let task_type = self
            .task_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::bad_request("type is required"))?;

        let priority = match self.priority.as_deref() {
            None => Priority::Normal,
            Some(name) => Priority::from_name(name).ok_or_else(|| {
                ApiError::bad_request(format!(
                    "invalid priority '{}' (expected low, normal, high or critical)",
                    name
                ))
            })?,
        };

        let mut task = Task::new(task_type).with_priority(priority);
        if let Some(target) = self.target.filter(|t| !t.trim().is_empty()) {
            task = task.with_target(target);
        }
        if let Some(parameters) = self.parameters {
            task.parameters = parameters;
        }
        if let Some(parallel) = self.parallel_enabled {
            task = task.with_parallel(parallel);
        }
        match self.timeout_secs {
            Some(0) => return Err(ApiError::bad_request("timeout_secs must be positive")),
            Some(secs) if secs > MAX_TIMEOUT_SECS => {
                return Err(ApiError::bad_request(format!(
                    "timeout_secs must be at most {}",
                    MAX_TIMEOUT_SECS
                )));
            }
            Some(secs) => task = task.with_timeout(Duration::from_secs(secs)),
            None => {}
        }
        Ok(task)
    }
}

pub async fn submit_task(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: SubmitRequest = parse_body(&body)?;
    let task = request.into_task()?;
    let task = state.orchestrator.submit(task).await?;
    Ok(ApiResponse::created(task))
}

pub async fn get_task(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult {
    match state.stores.tasks.get(&id).await? {
        Some(task) => Ok(ApiResponse::ok(task)),
        None => Err(ApiError::not_found(format!("task '{}' not found", id))),
    }
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult {
    let mut filter = TaskFilter::default();
    if let Some(status) = query.get("status").filter(|s| !s.is_empty()) {
        filter.status = Some(
            TaskStatus::from_status(status)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status '{}'", status)))?,
        );
    }
    if let Some(task_type) = query.get("type").filter(|s| !s.is_empty()) {
        filter.task_type = Some(task_type.clone());
    }
    if let Some(limit) = query.get("limit").filter(|s| !s.is_empty()) {
        filter.limit = Some(
            limit
                .parse::<usize>()
                .map_err(|_| ApiError::bad_request(format!("invalid limit '{}'", limit)))?,
        );
    }
    let tasks = state.stores.tasks.list(&filter).await?;
    Ok(ApiResponse::ok(tasks))
}

pub async fn cancel_task(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult {
    let outcome = state.orchestrator.cancel(&id).await?;
    let body = serde_json::json!({ "id": id, "outcome": outcome });
    Ok(match outcome {
        CancelOutcome::Cancelled => ApiResponse::ok(body),
        CancelOutcome::CancellationRequested => ApiResponse::accepted(body),
    })
}
