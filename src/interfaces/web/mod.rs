pub(crate) mod auth;
pub mod envelope;
mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use handlers::agents::AGENT_TOKEN_HEADER;
pub use router::build_api_router;

use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::Orchestrator;
use crate::core::store::Stores;

#[derive(Clone)]
pub struct AppState {
    pub(crate) stores: Stores,
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) token: Option<String>,
    pub(crate) api_port: u16,
    pub(crate) started_at: Instant,
}

impl AppState {
    pub fn new(
        stores: Stores,
        orchestrator: Arc<Orchestrator>,
        token: Option<String>,
        api_port: u16,
    ) -> Self {
        Self {
            stores,
            orchestrator,
            token: token.filter(|t| !t.is_empty()),
            api_port,
            started_at: Instant::now(),
        }
    }
}

/// Binds the listener and serves until `cancel` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let app = build_api_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
    bound: Option<SocketAddr>,
}

impl ApiServer {
    pub fn new(state: AppState, host: String, port: u16) -> Self {
        Self {
            state,
            host,
            port,
            bound: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    fn name(&self) -> &str {
        "api"
    }

    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self, cancel: CancellationToken) -> Result<Option<JoinHandle<()>>> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API server to {}", addr))?;
        let local = listener.local_addr()?;
        self.bound = Some(local);
        if self.state.token.is_none() && !local.ip().is_loopback() {
            tracing::warn!("API exposed on {} without a token; set server.token", local);
        }

        let state = self.state.clone();
        Ok(Some(tokio::spawn(async move {
            info!("API Server running at http://{}", local);
            if let Err(e) = serve(listener, state, cancel).await {
                tracing::error!("API Server crashed: {}", e);
            }
        })))
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shut down");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::orchestrator::{ExecutionReport, OrchestratorConfig, TaskExecutor};
    use crate::core::tasks::Task;
    use crate::core::webhook::WebhookSender;

    /// Executor that accepts no task type; stands in for an in-process agent.
    struct IdleExecutor(String);

    #[async_trait]
    impl TaskExecutor for IdleExecutor {
        fn name(&self) -> &str {
            &self.0
        }

        fn accepts(&self, _task_type: &str) -> bool {
            false
        }

        async fn execute(&self, _task: &Task, _cancel: CancellationToken) -> ExecutionReport {
            ExecutionReport::failure("idle executor")
        }
    }

    pub(crate) fn test_state(token: Option<&str>) -> AppState {
        test_state_with_agents(token, &[])
    }

    pub(crate) fn test_state_with_agents(token: Option<&str>, agents: &[&str]) -> AppState {
        let stores = Stores::memory();
        let executors: Vec<Arc<dyn TaskExecutor>> = agents
            .iter()
            .map(|name| Arc::new(IdleExecutor(name.to_string())) as Arc<dyn TaskExecutor>)
            .collect();
        let orchestrator = Orchestrator::new(
            stores.tasks.clone(),
            stores.status.clone(),
            executors,
            WebhookSender::disabled(),
            OrchestratorConfig::default(),
        );
        AppState::new(stores, orchestrator, token.map(str::to_string), 5005)
    }

    #[tokio::test]
    async fn lifecycle_binds_and_stops() {
        let mut server = ApiServer::new(test_state(None), "127.0.0.1".into(), 0);
        let cancel = CancellationToken::new();
        let handle = server.on_start(cancel.clone()).await.unwrap().unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let body = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("\"success\":true"));

        cancel.cancel();
        handle.await.unwrap();
    }
}
