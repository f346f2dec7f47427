mod memory;
mod sqlite;

use std::path::Path;
use std::sync::Arc;

use crate::core::status::StatusStore;
use crate::core::tasks::{MAX_TIMEOUT_SECS, Task, TaskQueue, TaskStatus};
use crate::core::webhook::WebhookStore;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("agent '{0}' is owned by another lease")]
    NotOwner(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared admission rules for `TaskQueue::enqueue`.
pub(crate) fn check_enqueue(task: &Task) -> Result<(), StoreError> {
    if task.status != TaskStatus::Queued {
        return Err(StoreError::Conflict(format!(
            "task {} must be queued on submission, got {}",
            task.id, task.status
        )));
    }
    if let Some(secs) = task.timeout_override
        && !(1..=MAX_TIMEOUT_SECS).contains(&secs)
    {
        return Err(StoreError::Invalid(format!(
            "timeout of task {} must be between 1 and {} seconds, got {}",
            task.id, MAX_TIMEOUT_SECS, secs
        )));
    }
    Ok(())
}

/// The three durable stores, usually backed by one database.
#[derive(Clone)]
pub struct Stores {
    pub status: Arc<dyn StatusStore>,
    pub tasks: Arc<dyn TaskQueue>,
    pub webhooks: Arc<dyn WebhookStore>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: StatusStore + TaskQueue + WebhookStore + 'static,
    {
        Self {
            status: backend.clone(),
            tasks: backend.clone(),
            webhooks: backend,
        }
    }

    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }

    pub fn sqlite(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_backend(Arc::new(SqliteStore::open(path)?)))
    }
}
