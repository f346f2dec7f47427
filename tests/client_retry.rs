
use autopilot::client::{ClientError, ControlClient, RetryPolicy};
use axum::{Json, Router, extract::OriginalUri, http::StatusCode, response::IntoResponse, routing::get};
use harness::{TestResult, closed_port, spawn_router};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use std::time::Duration;

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        timeout: Duration::from_secs(2),
    }
}

fn envelope(status: StatusCode, data: serde_json::Value) -> axum::response::Response {
    let ok = status.is_success();
    (
        status,
        Json(json!({
            "success": ok,
            "data": if ok { data } else { serde_json::Value::Null },
            "error": if ok { serde_json::Value::Null } else { json!("simulated failure") },
            "statusCode": status.as_u16(),
            "responseTime": 1,
        })),
    )
        .into_response()
}

/// Answers `/health` with the given statuses in order, repeating the last.
async fn scripted_server(script: Vec<StatusCode>) -> TestResult<(String, Arc<AtomicU32>)> {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/health",
        get(move || {
            let counter = counter.clone();
            let script = script.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
                let status = script[n.min(script.len() - 1)];
                envelope(
                    status,
                    json!({ "ok": true, "uptime_secs": 1, "version": "test" }),
                )
            }
        }),
    );
    let (addr, _) = spawn_router(app).await?;
    Ok((format!("http://{}", addr), hits))
}

#[tokio::test]
async fn retries_through_transient_5xx() -> TestResult<()> {
    let (url, hits) = scripted_server(vec![
        StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::OK,
    ])
    .await?;
    let client = ControlClient::new(&url)?.with_policy(fast_policy());

    let reply = client.health().await?;
    assert_eq!(reply.attempts, 3);
    assert_eq!(reply.status_code, 200);
    assert_eq!(reply.response_time, 1);
    assert!(reply.data.ok);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn client_errors_are_never_retried() -> TestResult<()> {
    let (url, hits) = scripted_server(vec![StatusCode::BAD_REQUEST]).await?;
    let client = ControlClient::new(&url)?.with_policy(fast_policy());

    match client.health().await {
        Err(ClientError::Api { status, message }) => {
            assert_eq!(status, 400);
            assert_eq!(message, "simulated failure");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn persistent_5xx_surfaces_as_server_error() -> TestResult<()> {
    let (url, hits) = scripted_server(vec![StatusCode::INTERNAL_SERVER_ERROR]).await?;
    let client = ControlClient::new(&url)?.with_policy(fast_policy());

    let err = client.health().await.unwrap_err();
    assert!(matches!(err, ClientError::Server { status: 500, .. }), "{err}");
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn refused_connections_are_a_connection_error() -> TestResult<()> {
    let port = closed_port().await?;
    let client = ControlClient::new(&format!("http://127.0.0.1:{}", port))?
        .with_policy(fast_policy());

    match client.health().await {
        Err(ClientError::Connection { attempts, .. }) => assert_eq!(attempts, 4),
        other => panic!("expected Connection error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn slow_responses_are_a_timeout_error() -> TestResult<()> {
    let app = Router::new().route(
        "/health",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            envelope(StatusCode::OK, json!({ "ok": true, "uptime_secs": 1, "version": "x" }))
        }),
    );
    let (addr, _) = spawn_router(app).await?;
    let client = ControlClient::new(&format!("http://{}", addr))?.with_policy(RetryPolicy {
        max_retries: 1,
        retry_delay: Duration::from_millis(10),
        timeout: Duration::from_millis(100),
    });

    match client.health().await {
        Err(ClientError::Timeout { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected Timeout error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn path_segments_are_percent_encoded() -> TestResult<()> {
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let recorder = seen.clone();
    let app = Router::new().fallback(move |OriginalUri(uri): OriginalUri| {
        let recorder = recorder.clone();
        async move {
            recorder.lock().await.push(uri.path().to_string());
            envelope(StatusCode::NOT_FOUND, serde_json::Value::Null)
        }
    });
    let (addr, _) = spawn_router(app).await?;
    let client = ControlClient::new(&format!("http://{}", addr))?.with_policy(fast_policy());

    let err = client.cancel_task("a b/c").await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    let err = client.controller("build ops").await.unwrap_err();
    assert_eq!(err.status(), Some(404));

    assert_eq!(
        *seen.lock().await,
        vec![
            "/tasks/a%20b%2Fc/cancel".to_string(),
            "/controllers/build%20ops".to_string(),
        ]
    );
    Ok(())
}
