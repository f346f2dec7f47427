use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::agent::{
    AgentRuntime, Backup, Capabilities, CommandAction, CommandValidate, SnapshotBackup, Validate,
};
use crate::core::config::{AgentConfig, AutopilotConfig, BackupMode, StorageBackend};
use crate::core::lifecycle::{LifecycleComponent, LifecycleManager};
use crate::core::orchestrator::{Orchestrator, TaskExecutor};
use crate::core::store::Stores;
use crate::core::terminal::{self, GuideSection};
use crate::core::webhook::WebhookDispatcher;
use crate::interfaces::web::{ApiServer, AppState};
use crate::platform::{NativePlatform, Platform};

struct AgentWorker {
    runtime: Arc<AgentRuntime>,
}

#[async_trait]
impl LifecycleComponent for AgentWorker {
    fn name(&self) -> &str {
        &self.runtime.spec().name
    }

    async fn on_start(&mut self, cancel: CancellationToken) -> Result<Option<JoinHandle<()>>> {
        Ok(Some(tokio::spawn(self.runtime.clone().run(cancel))))
    }
}

struct OrchestratorWorker {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl LifecycleComponent for OrchestratorWorker {
    fn name(&self) -> &str {
        "orchestrator"
    }

    async fn on_start(&mut self, cancel: CancellationToken) -> Result<Option<JoinHandle<()>>> {
        Ok(Some(tokio::spawn(self.orchestrator.clone().run(cancel))))
    }
}

struct WebhookWorker {
    dispatcher: Option<WebhookDispatcher>,
}

#[async_trait]
impl LifecycleComponent for WebhookWorker {
    fn name(&self) -> &str {
        "webhooks"
    }

    async fn on_start(&mut self, cancel: CancellationToken) -> Result<Option<JoinHandle<()>>> {
        Ok(self
            .dispatcher
            .take()
            .map(|d| tokio::spawn(d.run(cancel))))
    }
}

/// Builds the capability set for one configured agent. Read-only agents never
/// take backups.
pub(crate) fn capabilities_for(agent: &AgentConfig, data_dir: &Path) -> Capabilities {
    let backup: Option<Arc<dyn Backup>> = match (agent.mutating, agent.backup) {
        (true, BackupMode::Snapshot) => Some(Arc::new(SnapshotBackup::new(
            data_dir.join("backups").join(&agent.name),
        ))),
        _ => None,
    };
    let validate = agent
        .validate
        .as_ref()
        .map(|cmd| Arc::new(CommandValidate::new(cmd.clone())) as Arc<dyn Validate>);
    let test = agent
        .test
        .as_ref()
        .map(|cmd| Arc::new(CommandValidate::new(cmd.clone())) as Arc<dyn Validate>);
    Capabilities {
        backup,
        action: Arc::new(CommandAction::new(agent.action.clone())),
        validate,
        test,
    }
}

pub async fn run_serve(config_path: Option<PathBuf>) -> Result<()> {
    let data_dir = NativePlatform::data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    NativePlatform::restrict_dir_permissions(&data_dir);

    let config_path = config_path.unwrap_or_else(|| AutopilotConfig::default_path(&data_dir));
    let config = AutopilotConfig::load(&config_path).await?;
    crate::logging::init(&config.log.level, config.log_file(&data_dir).as_deref())?;
    terminal::print_banner();

    let stores = match config.storage.backend {
        StorageBackend::Memory => Stores::memory(),
        StorageBackend::Sqlite => {
            let path = config.database_path(&data_dir);
            info!("Opening store at {}", path.display());
            Stores::sqlite(&path)?
        }
    };
    stores
        .tasks
        .update_settings(config.orchestrator.queue_settings())
        .await?;

    let (dispatcher, webhook_sender) =
        WebhookDispatcher::new(stores.webhooks.clone(), config.webhooks.delivery())?;

    let mut runtimes = Vec::new();
    for agent in &config.agents {
        let runtime = AgentRuntime::start(
            agent.spec()?,
            capabilities_for(agent, &data_dir),
            stores.status.clone(),
        )
        .await
        .with_context(|| format!("failed to start agent '{}'", agent.name))?;
        runtimes.push(runtime);
    }
    let executors: Vec<Arc<dyn TaskExecutor>> = runtimes
        .iter()
        .map(|r| r.clone() as Arc<dyn TaskExecutor>)
        .collect();

    let orchestrator = Orchestrator::new(
        stores.tasks.clone(),
        stores.status.clone(),
        executors,
        webhook_sender,
        config.orchestrator.runtime(),
    );
    let state = AppState::new(
        stores.clone(),
        orchestrator.clone(),
        config.server.token.clone(),
        config.server.port,
    );
    let api = Arc::new(Mutex::new(ApiServer::new(
        state,
        config.server.host.clone(),
        config.server.port,
    )));

    let mut manager = LifecycleManager::new();
    manager.attach(Arc::new(Mutex::new(WebhookWorker {
        dispatcher: Some(dispatcher),
    })));
    for runtime in runtimes {
        manager.attach(Arc::new(Mutex::new(AgentWorker { runtime })));
    }
    manager.attach(Arc::new(Mutex::new(OrchestratorWorker {
        orchestrator: orchestrator.clone(),
    })));
    manager.attach(api.clone());
    manager.start().await?;

    let addr = api
        .lock()
        .await
        .local_addr()
        .map(|a| format!("http://{}", a))
        .unwrap_or_default();
    let settings = config.orchestrator.queue_settings();
    GuideSection::new("autopilot is running")
        .status("Control API", &addr)
        .status("Config", &config_path.display().to_string())
        .status("Agents", &orchestrator.executor_names().join(", "))
        .status(
            "Concurrency",
            &format!(
                "{} ({})",
                settings.concurrency_limit(),
                if settings.parallel_mode {
                    "parallel"
                } else {
                    "serial"
                }
            ),
        )
        .blank()
        .text("Press Ctrl+C to stop.")
        .print();

    tokio::signal::ctrl_c().await?;
    terminal::print_info("Shutting down...");
    manager.shutdown().await?;
    terminal::print_success("Stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(toml: &str) -> AgentConfig {
        AutopilotConfig::from_toml_str(toml).unwrap().agents.remove(0)
    }

    #[test]
    fn mutating_snapshot_agents_get_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let caps = capabilities_for(
            &agent(
                r#"
[[agents]]
name = "builder"
subject = "."
action = "make"
validate = "make check"
"#,
            ),
            dir.path(),
        );
        assert!(caps.backup.is_some());
        assert!(caps.validate.is_some());
        assert!(caps.test.is_none());
    }

    #[test]
    fn read_only_agents_skip_backups() {
        let dir = tempfile::tempdir().unwrap();
        let caps = capabilities_for(
            &agent(
                r#"
[[agents]]
name = "scanner"
subject = "."
action = "scan"
mutating = false
"#,
            ),
            dir.path(),
        );
        assert!(caps.backup.is_none());
    }
}
