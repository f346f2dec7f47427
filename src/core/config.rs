use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::agent::{AgentSpec, IntervalError, IntervalPolicy};
use crate::core::orchestrator::OrchestratorConfig;
use crate::core::tasks::QueueSettings;
use crate::core::webhook::DeliveryConfig;

pub const CONFIG_FILE: &str = "autopilot.toml";
pub const DEFAULT_PORT: u16 = 5005;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("agent '{agent}': {source}")]
    Interval {
        agent: String,
        source: IntervalError,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AutopilotConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub webhooks: WebhookSection,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Static bearer token; the API is open when unset.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorSection {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_true")]
    pub parallel_mode: bool,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file; defaults to `<data_dir>/autopilot.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookSection {
    #[serde(default = "default_webhook_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_webhook_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append-only log file; relative paths resolve against the data dir.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    #[default]
    Snapshot,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub name: String,
    /// Directory the agent's commands run in.
    pub subject: String,
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default = "default_true")]
    pub mutating: bool,
    pub action: String,
    #[serde(default)]
    pub validate: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub backup: BackupMode,
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    #[serde(default = "default_step")]
    pub step_secs: u64,
    #[serde(default = "default_initial_interval")]
    pub initial_interval_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_degrade_after")]
    pub degrade_after: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_true() -> bool {
    true
}
fn default_tick_ms() -> u64 {
    500
}
fn default_max_concurrent() -> usize {
    2
}
fn default_timeout_secs() -> u64 {
    3600
}
fn default_webhook_attempts() -> u32 {
    3
}
fn default_webhook_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_min_interval() -> u64 {
    60
}
fn default_max_interval() -> u64 {
    1800
}
fn default_step() -> u64 {
    60
}
fn default_initial_interval() -> u64 {
    300
}
fn default_heartbeat() -> u64 {
    300
}
fn default_degrade_after() -> u32 {
    3
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            token: None,
        }
    }
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_concurrent: default_max_concurrent(),
            parallel_mode: true,
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            max_attempts: default_webhook_attempts(),
            request_timeout_secs: default_webhook_timeout(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl OrchestratorSection {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            parallel_mode: self.parallel_mode,
            max_concurrent: self.max_concurrent,
        }
    }

    pub fn runtime(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            tick: Duration::from_millis(self.tick_ms),
            default_timeout: Duration::from_secs(self.default_timeout_secs),
        }
    }
}

impl WebhookSection {
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: self.max_attempts,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..Default::default()
        }
    }
}

impl AgentConfig {
    pub fn policy(&self) -> Result<IntervalPolicy, ConfigError> {
        IntervalPolicy::new(
            Duration::from_secs(self.min_interval_secs),
            Duration::from_secs(self.max_interval_secs),
            Duration::from_secs(self.step_secs),
            Duration::from_secs(self.initial_interval_secs),
        )
        .map_err(|source| ConfigError::Interval {
            agent: self.name.clone(),
            source,
        })
    }

    pub fn spec(&self) -> Result<AgentSpec, ConfigError> {
        Ok(AgentSpec {
            name: self.name.clone(),
            subject: self.subject.clone(),
            task_types: self.task_types.clone(),
            mutating: self.mutating,
            policy: self.policy()?,
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
            degrade_after: self.degrade_after.max(1),
        })
    }
}

impl AutopilotConfig {
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    /// Reads `path`; a missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No {} found, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml_str(&content)?;
        info!(
            "Loaded config from {}: {} agent(s), storage={:?}",
            path.display(),
            config.agents.len(),
            config.storage.backend
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AutopilotConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_concurrent must be at least 1".into(),
            ));
        }
        if self.orchestrator.tick_ms == 0 {
            return Err(ConfigError::Invalid("orchestrator.tick_ms must be positive".into()));
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(ConfigError::Invalid("agent name must not be empty".into()));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
            if agent.action.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "agent '{}' has no action command",
                    agent.name
                )));
            }
            agent.policy()?;
        }
        Ok(())
    }

    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("autopilot.db"))
    }

    pub fn log_file(&self, data_dir: &Path) -> Option<PathBuf> {
        self.log.file.as_ref().map(|f| {
            if f.is_absolute() {
                f.clone()
            } else {
                data_dir.join(f)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
port = 6006
token = "s3cret"

[orchestrator]
max_concurrent = 1
parallel_mode = false

[storage]
backend = "memory"

[[agents]]
name = "builder"
subject = "/srv/app"
task_types = ["build"]
action = "cargo build --release"
validate = "cargo check"
test = "cargo test"

[[agents]]
name = "scanner"
subject = "/srv/app"
task_types = ["scan"]
mutating = false
backup = "none"
action = "cargo audit"
initial_interval_secs = 600
"#;

    #[test]
    fn defaults_match_documented_values() {
        let config = AutopilotConfig::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.server.token.is_none());
        assert_eq!(config.orchestrator.queue_settings(), QueueSettings::default());
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.webhooks.max_attempts, 3);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn parses_full_file() {
        let config = AutopilotConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 6006);
        assert_eq!(config.server.token.as_deref(), Some("s3cret"));
        assert_eq!(config.orchestrator.queue_settings().concurrency_limit(), 1);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.agents.len(), 2);

        let builder = config.agents[0].spec().unwrap();
        assert!(builder.mutating);
        assert_eq!(config.agents[0].backup, BackupMode::Snapshot);
        assert_eq!(builder.policy.initial(), Duration::from_secs(300));

        let scanner = config.agents[1].spec().unwrap();
        assert!(!scanner.mutating);
        assert_eq!(config.agents[1].backup, BackupMode::None);
        assert_eq!(scanner.policy.initial(), Duration::from_secs(600));
    }

    #[test]
    fn rejects_duplicate_agents() {
        let toml = r#"
[[agents]]
name = "a"
subject = "."
action = "true"

[[agents]]
name = "a"
subject = "."
action = "true"
"#;
        let err = AutopilotConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate agent name"));
    }

    #[test]
    fn rejects_inverted_interval_bounds() {
        let toml = r#"
[[agents]]
name = "a"
subject = "."
action = "true"
min_interval_secs = 900
max_interval_secs = 60
"#;
        let err = AutopilotConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Interval { .. }), "{err}");
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(AutopilotConfig::from_toml_str("[server]\nprot = 1\n").is_err());
    }

    #[tokio::test]
    async fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutopilotConfig::load(&dir.path().join(CONFIG_FILE))
            .await
            .unwrap();
        assert!(config.agents.is_empty());
    }

    #[test]
    fn relative_paths_resolve_against_data_dir() {
        let mut config = AutopilotConfig::default();
        let data = Path::new("/var/lib/autopilot");
        assert_eq!(config.database_path(data), data.join("autopilot.db"));
        config.log.file = Some(PathBuf::from("autopilot.log"));
        assert_eq!(config.log_file(data), Some(data.join("autopilot.log")));
    }
}
