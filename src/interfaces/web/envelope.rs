use axum::{
    Json,
    body::{Body, Bytes},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Instant;
use tracing::{debug, warn};

use crate::core::store::StoreError;
use crate::core::tasks::ParameterError;
use crate::core::webhook::WebhookValidationError;

/// Largest body the response-time stamp will buffer and rewrite.
const STAMP_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub status_code: u16,
    /// Server-side handling time in milliseconds.
    pub response_time: u64,
}

/// Successful reply; wrapped in the envelope on the way out.
pub struct ApiResponse {
    status: StatusCode,
    data: serde_json::Value,
}

impl ApiResponse {
    pub fn ok(data: impl Serialize) -> Self {
        Self::with_status(StatusCode::OK, data)
    }

    pub fn created(data: impl Serialize) -> Self {
        Self::with_status(StatusCode::CREATED, data)
    }

    pub fn accepted(data: impl Serialize) -> Self {
        Self::with_status(StatusCode::ACCEPTED, data)
    }

    fn with_status(status: StatusCode, data: impl Serialize) -> Self {
        let data = serde_json::to_value(data).unwrap_or_else(|e| {
            warn!("Failed to serialize response payload: {}", e);
            serde_json::Value::Null
        });
        Self { status, data }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let body = Envelope {
            success: true,
            data: Some(self.data),
            error: None,
            status_code: self.status.as_u16(),
            response_time: 0,
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            error: Some(self.message),
            status_code: self.status.as_u16(),
            response_time: 0,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::not_found(format!("{} not found", what)),
            StoreError::Conflict(msg) => Self::conflict(msg),
            StoreError::Invalid(msg) => Self::bad_request(msg),
            StoreError::NotOwner(name) => {
                Self::unauthorized(format!("invalid agent token for '{}'", name))
            }
            other => {
                warn!("Store failure while handling request: {}", other);
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<ParameterError> for ApiError {
    fn from(err: ParameterError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<WebhookValidationError> for ApiError {
    fn from(err: WebhookValidationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

pub type ApiResult = Result<ApiResponse, ApiError>;

/// Strict JSON body parsing; any malformed input is a 400 in the envelope.
pub fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("request body is required"));
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("malformed JSON: {}", e)))
}

/// Rewrites the envelope's `responseTime` with the time spent in the stack
/// below this layer. Non-envelope bodies pass through untouched.
pub async fn stamp_response_time(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;

    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, STAMP_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Could not buffer response body for {} {}: {}", method, path, e);
            return ApiError::internal("response body unavailable").into_response();
        }
    };
    let elapsed = started.elapsed().as_millis() as u64;
    debug!("{} {} -> {} in {}ms", method, path, parts.status, elapsed);

    let rewritten = match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(serde_json::Value::Object(mut map)) if map.contains_key("responseTime") => {
            map.insert("responseTime".into(), elapsed.into());
            serde_json::to_vec(&map).ok()
        }
        _ => None,
    };
    match rewritten {
        Some(body) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            if let Ok(len) = HeaderValue::from_str(&body.len().to_string()) {
                parts.headers.insert(header::CONTENT_LENGTH, len);
            }
            Response::from_parts(parts, Body::from(body))
        }
        None => Response::from_parts(parts, Body::from(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn success_envelope_shape() {
        let resp = ApiResponse::created(serde_json::json!({ "id": "task_1" })).into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["id"], "task_1");
        assert!(json["error"].is_null());
        assert_eq!(json["statusCode"], 201);
        assert!(json["responseTime"].is_u64());
    }

    #[tokio::test]
    async fn store_errors_map_to_status_codes() {
        let cases = [
            (StoreError::NotFound("task x".into()), StatusCode::NOT_FOUND),
            (StoreError::Conflict("terminal".into()), StatusCode::CONFLICT),
            (StoreError::Invalid("timeout".into()), StatusCode::BAD_REQUEST),
            (StoreError::NotOwner("scanner".into()), StatusCode::UNAUTHORIZED),
            (StoreError::Corrupt("bad row".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let resp = ApiError::from(err).into_response();
            assert_eq!(resp.status(), status);
            let json = body_json(resp).await;
            assert_eq!(json["success"], false);
            assert!(json["data"].is_null());
            assert_eq!(json["statusCode"], status.as_u16());
        }
    }

    #[test]
    fn parse_body_rejects_garbage() {
        let err = parse_body::<serde_json::Value>(&Bytes::from_static(b"{not json")).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err = parse_body::<serde_json::Value>(&Bytes::new()).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
