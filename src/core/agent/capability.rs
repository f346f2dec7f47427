use async_trait::async_trait;

use crate::core::tasks::Parameters;

/// Structured result of an action or validation stage.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Outcome {
    pub ok: bool,
    pub diagnostics: String,
}

impl Outcome {
    pub fn success(diagnostics: impl Into<String>) -> Self {
        Self {
            ok: true,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn failure(diagnostics: impl Into<String>) -> Self {
        Self {
            ok: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// Opaque handle to a backup, understood only by the `Backup` that made it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BackupRef(pub String);

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("backup failed: {0}")]
    Backup(String),
    #[error("restore failed: {0}")]
    Restore(String),
    #[error("process failed to start: {0}")]
    Spawn(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Backup: Send + Sync {
    async fn backup(&self, subject: &str) -> Result<BackupRef, CapabilityError>;

    async fn restore(&self, subject: &str, backup: &BackupRef) -> Result<(), CapabilityError>;
}

#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, subject: &str, params: &Parameters) -> Result<Outcome, CapabilityError>;
}

#[async_trait]
pub trait Validate: Send + Sync {
    async fn run(&self, subject: &str) -> Result<Outcome, CapabilityError>;
}
