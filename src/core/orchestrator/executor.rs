use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::agent::{BuildCycle, FinalOutcome};
use crate::core::tasks::{Task, TaskStatus};

/// Capacity the orchestrator dispatches tasks to.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn accepts(&self, task_type: &str) -> bool;

    /// Runs the task to completion. Implementations should stop early once
    /// `cancel` fires and report `Cancelled`.
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> ExecutionReport;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub status: TaskStatus,
    pub summary: String,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Succeeded,
            summary: summary.into(),
        }
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            summary: summary.into(),
        }
    }

    pub fn cancelled(summary: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            summary: summary.into(),
        }
    }

    pub fn from_cycle(cycle: &BuildCycle) -> Self {
        let summary = cycle.summary();
        match cycle.final_outcome {
            FinalOutcome::Success => Self::success(summary),
            FinalOutcome::RolledBack | FinalOutcome::Error => Self::failure(summary),
            FinalOutcome::Cancelled => Self::cancelled(summary),
        }
    }
}
