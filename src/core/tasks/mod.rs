mod params;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::core::store::StoreError;

pub use params::{ParameterError, Parameters};

pub type TaskId = String;

/// Largest accepted per-task timeout override (30 days).
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status moves forward only: nothing re-enters `queued` and terminal states are final.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    match from {
        TaskStatus::Queued => matches!(to, TaskStatus::Running | TaskStatus::Cancelled),
        TaskStatus::Running => to.is_terminal(),
        TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled => false,
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    /// Numeric rank persisted alongside the name so the queue can sort in SQL.
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub target: Option<String>,
    pub parameters: Parameters,
    pub priority: Priority,
    pub status: TaskStatus,
    pub parallel_enabled: bool,
    /// Per-task timeout override in seconds.
    pub timeout_override: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub seq: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_agent: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Task {
    /// A fresh queued task. `seq` is assigned by the queue on enqueue.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4().simple()),
            task_type: task_type.into(),
            target: None,
            parameters: Parameters::default(),
            priority: Priority::Normal,
            status: TaskStatus::Queued,
            parallel_enabled: true,
            timeout_override: None,
            created_at: Utc::now(),
            seq: 0,
            started_at: None,
            completed_at: None,
            assigned_agent: None,
            result: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_parallel(mut self, parallel_enabled: bool) -> Self {
        self.parallel_enabled = parallel_enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout.as_secs());
        self
    }

    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout_override
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Dispatch order: higher priority first, then oldest, then submission order.
    pub fn dispatch_order(a: &Task, b: &Task) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.seq.cmp(&b.seq))
    }
}

/// Fields written together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub assigned_agent: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl TransitionPatch {
    pub fn assigned_to(agent: &str) -> Self {
        Self {
            assigned_agent: Some(agent.to_string()),
            ..Default::default()
        }
    }

    pub fn result(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Applies a validated transition to an in-memory task, stamping timestamps.
pub(crate) fn apply_transition(
    task: &mut Task,
    new: TaskStatus,
    patch: TransitionPatch,
    now: DateTime<Utc>,
) {
    task.status = new;
    if new == TaskStatus::Running {
        task.started_at = Some(now);
    }
    if new.is_terminal() {
        task.completed_at = Some(now);
    }
    if let Some(agent) = patch.assigned_agent {
        task.assigned_agent = Some(agent);
    }
    if let Some(result) = patch.result {
        task.result = Some(result);
    }
    if let Some(error) = patch.error {
        task.error = Some(error);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| t == task.task_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueSettings {
    pub parallel_mode: bool,
    pub max_concurrent: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            parallel_mode: true,
            max_concurrent: 2,
        }
    }
}

impl QueueSettings {
    pub fn concurrency_limit(&self) -> usize {
        if self.parallel_mode {
            self.max_concurrent.max(1)
        } else {
            1
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Stores a queued task and returns it with its submission sequence.
    async fn enqueue(&self, task: Task) -> Result<Task, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Tasks matching the filter, in dispatch order.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Compare-and-set status change. Returns false when the stored status is
    /// not `expected`; illegal transitions are rejected with `Conflict`.
    async fn transition(
        &self,
        id: &str,
        expected: TaskStatus,
        new: TaskStatus,
        patch: TransitionPatch,
    ) -> Result<bool, StoreError>;

    async fn settings(&self) -> Result<QueueSettings, StoreError>;

    async fn update_settings(&self, settings: QueueSettings) -> Result<(), StoreError>;
}
