use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Starting,
    Ready,
    Shutdown,
}

/// A long-lived piece of the daemon. `on_start` receives a child of the
/// manager's shutdown token and hands back the task it spawned, if any.
#[async_trait::async_trait]
pub trait LifecycleComponent: Send + Sync {
    fn name(&self) -> &str;

    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn on_start(&mut self, cancel: CancellationToken) -> Result<Option<JoinHandle<()>>>;

    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent>>>,
    tasks: Vec<(String, JoinHandle<()>)>,
    cancel: CancellationToken,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Token cancelled when `shutdown` begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent>>) {
        self.components.push(component);
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Starting");
        self.state = LifecycleState::Starting;
        // Started in attach order; later components may depend on earlier ones.
        for comp in &self.components {
            let mut comp = comp.lock().await;
            if let Some(handle) = comp.on_start(self.cancel.child_token()).await? {
                self.tasks.push((comp.name().to_string(), handle));
            }
        }

        info!("Lifecycle Phase: Ready ({} task(s))", self.tasks.len());
        self.state = LifecycleState::Ready;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;
        self.cancel.cancel();

        for (name, handle) in self.tasks.drain(..).rev() {
            if let Err(e) = handle.await {
                warn!("Component '{}' task ended abnormally: {}", name, e);
            }
        }
        for comp in self.components.iter().rev() {
            let mut comp = comp.lock().await;
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component '{}' shutdown error: {}", comp.name(), e);
            }
        }
        Ok(())
    }
}
