use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    response::IntoResponse,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::AppState;
use super::auth;
use super::envelope::{ApiError, stamp_response_time};
use super::handlers::{agents, status, tasks, webhooks};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    // Liveness and agent heartbeats skip the bearer check; heartbeats are
    // authenticated by the agent's lease token instead.
    let public_routes = Router::new()
        .route("/health", get(status::get_health))
        .route("/agents/{name}/heartbeat", post(agents::agent_heartbeat));

    let authed_routes = Router::new()
        .route("/status", get(status::get_status))
        .route("/controllers", get(agents::list_controllers))
        .route("/controllers/{name}", get(agents::get_controller))
        .route("/agents/register", post(agents::register_agent))
        .route("/tasks/submit", post(tasks::submit_task))
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/cancel", post(tasks::cancel_task))
        .route(
            "/webhooks",
            get(webhooks::list_webhooks).post(webhooks::create_webhook),
        )
        .route("/webhooks/stats", get(webhooks::webhook_stats))
        .route("/webhooks/{id}", delete(webhooks::delete_webhook))
        .route("/webhooks/{id}/deliveries", get(webhooks::list_deliveries))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let api_port = state.api_port;
    public_routes
        .merge(authed_routes)
        .fallback(not_found)
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(stamp_response_time))
        .layer(build_localhost_cors(api_port))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found(req: Request<Body>) -> axum::response::Response {
    ApiError::not_found(format!("no route for {} {}", req.method(), req.uri().path()))
        .into_response()
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}
