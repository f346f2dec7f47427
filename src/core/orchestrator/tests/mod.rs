mod dispatch;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{ExecutionReport, Orchestrator, OrchestratorConfig, TaskExecutor};
use crate::core::store::MemoryStore;
use crate::core::tasks::{QueueSettings, Task, TaskQueue, TaskStatus};
use crate::core::webhook::WebhookSender;

/// Executor whose tasks block until the test releases them.
pub(super) struct GatedExecutor {
    name: String,
    types: Vec<String>,
    gate: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    started: Arc<StdMutex<Vec<String>>>,
    outcome: TaskStatus,
}

/// Counters shared by all executors of one test.
#[derive(Clone, Default)]
pub(super) struct Observed {
    pub active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
    pub started: Arc<StdMutex<Vec<String>>>,
}

impl Observed {
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl GatedExecutor {
    pub fn new(name: &str, types: &[&str], gate: Arc<Semaphore>, observed: &Observed) -> Self {
        Self {
            name: name.to_string(),
            types: types.iter().map(|t| t.to_string()).collect(),
            gate,
            active: observed.active.clone(),
            max_active: observed.max_active.clone(),
            started: observed.started.clone(),
            outcome: TaskStatus::Succeeded,
        }
    }

    pub fn failing(mut self) -> Self {
        self.outcome = TaskStatus::Failed;
        self
    }
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, task_type: &str) -> bool {
        self.types.iter().any(|t| t == task_type)
    }

    async fn execute(&self, task: &Task, cancel: CancellationToken) -> ExecutionReport {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(task.id.clone());

        let report = tokio::select! {
            _ = cancel.cancelled() => ExecutionReport::cancelled("aborted"),
            permit = self.gate.acquire() => {
                if let Ok(p) = permit {
                    p.forget();
                }
                match self.outcome {
                    TaskStatus::Succeeded => ExecutionReport::success("done"),
                    _ => ExecutionReport::failure("action failed; rolled back"),
                }
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        report
    }
}

pub(super) struct Harness {
    pub store: Arc<MemoryStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub gate: Arc<Semaphore>,
    pub observed: Observed,
}

impl Harness {
    /// `executors` is a list of `(name, accepted types)`.
    pub fn new(settings: QueueSettings, executors: &[(&str, &[&str])]) -> Self {
        Self::with_config(settings, executors, OrchestratorConfig::default())
    }

    pub fn with_config(
        settings: QueueSettings,
        executors: &[(&str, &[&str])],
        config: OrchestratorConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::with_settings(settings));
        let gate = Arc::new(Semaphore::new(0));
        let observed = Observed::default();
        let executors: Vec<Arc<dyn TaskExecutor>> = executors
            .iter()
            .map(|(name, types)| {
                Arc::new(GatedExecutor::new(name, types, gate.clone(), &observed))
                    as Arc<dyn TaskExecutor>
            })
            .collect();
        let orchestrator = Orchestrator::new(
            store.clone(),
            store.clone(),
            executors,
            WebhookSender::disabled(),
            config,
        );
        Self {
            store,
            orchestrator,
            gate,
            observed,
        }
    }

    pub async fn submit(&self, task: Task) -> Task {
        self.orchestrator.submit(task).await.unwrap()
    }

    pub async fn status_of(&self, id: &str) -> TaskStatus {
        TaskQueue::get(self.store.as_ref(), id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    /// Releases one blocked execution.
    pub fn release_one(&self) {
        self.gate.add_permits(1);
    }

    pub async fn wait_for_status(&self, id: &str, want: TaskStatus) {
        for _ in 0..200 {
            if self.status_of(id).await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "task {} never reached {:?} (is {:?})",
            id,
            want,
            self.status_of(id).await
        );
    }

    pub async fn wait_idle(&self) {
        for _ in 0..200 {
            if self.orchestrator.in_flight().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("executions never drained");
    }
}
