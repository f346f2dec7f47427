mod executor;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::status::StatusStore;
use crate::core::store::StoreError;
use crate::core::tasks::{Task, TaskFilter, TaskId, TaskQueue, TaskStatus, TransitionPatch};
use crate::core::webhook::{WebhookEvent, WebhookSender};

pub use executor::{ExecutionReport, TaskExecutor};

pub const DEFAULT_TICK: Duration = Duration::from_millis(500);
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tick: Duration,
    pub default_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            default_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task never ran.
    Cancelled,
    /// The task is running; its executor has been signalled and the task
    /// may still finish with another status.
    CancellationRequested,
}

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub timed_out: Vec<TaskId>,
    /// `(task id, executor name)` pairs.
    pub dispatched: Vec<(TaskId, String)>,
}

struct InFlight {
    executor: String,
    cancel: CancellationToken,
}

/// Dispatches queued tasks to executors under the queue's concurrency limit.
pub struct Orchestrator {
    queue: Arc<dyn TaskQueue>,
    status: Arc<dyn StatusStore>,
    executors: Vec<Arc<dyn TaskExecutor>>,
    webhooks: WebhookSender,
    config: OrchestratorConfig,
    in_flight: Mutex<HashMap<TaskId, InFlight>>,
    tick_lock: Mutex<()>,
    stale_seen: Mutex<HashSet<String>>,
    wake: Notify,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        status: Arc<dyn StatusStore>,
        executors: Vec<Arc<dyn TaskExecutor>>,
        webhooks: WebhookSender,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            status,
            executors,
            webhooks,
            config,
            in_flight: Mutex::new(HashMap::new()),
            tick_lock: Mutex::new(()),
            stale_seen: Mutex::new(HashSet::new()),
            wake: Notify::new(),
        })
    }

    pub fn executor_names(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.name().to_string()).collect()
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Enqueues a task and wakes the driver.
    pub async fn submit(&self, task: Task) -> Result<Task, StoreError> {
        let task = self.queue.enqueue(task).await?;
        info!(
            "Task {} submitted (type {}, priority {})",
            task.id,
            task.task_type,
            task.priority.as_str()
        );
        self.wake.notify_one();
        Ok(task)
    }

    /// Drives `dispatch_tick` every `config.tick` (or sooner when woken)
    /// until cancelled, then signals every in-flight task.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Orchestrator started with {} executor(s), tick {}ms",
            self.executors.len(),
            self.config.tick.as_millis()
        );
        loop {
            if let Err(e) = self.dispatch_tick().await {
                warn!("Dispatch tick failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = self.wake.notified() => {}
            }
        }
        for (id, flight) in self.in_flight.lock().await.iter() {
            debug!("Aborting task {} on {}", id, flight.executor);
            flight.cancel.cancel();
        }
        info!("Orchestrator stopped");
    }

    /// One pass of timeouts, eligibility and dispatch. Safe to call at any
    /// rate; concurrent calls are serialised.
    pub async fn dispatch_tick(self: &Arc<Self>) -> Result<TickReport, StoreError> {
        let _tick = self.tick_lock.lock().await;
        let mut report = TickReport::default();

        self.expire_timed_out(&mut report).await?;
        let eligible = self.eligible_executors().await?;

        let settings = self.queue.settings().await?;
        let limit = settings.concurrency_limit();
        let running = self.queue.list(&TaskFilter::status(TaskStatus::Running)).await?;
        let mut running_count = running.len();
        // type -> whether any running task of that type is non-parallel
        let mut running_types: HashMap<String, bool> = HashMap::new();
        for t in &running {
            let serial = running_types.entry(t.task_type.clone()).or_insert(false);
            *serial |= !t.parallel_enabled;
        }
        if running_count >= limit {
            return Ok(report);
        }

        let mut busy: HashSet<String> = self
            .in_flight
            .lock()
            .await
            .values()
            .map(|f| f.executor.clone())
            .collect();

        let queued = self.queue.list(&TaskFilter::status(TaskStatus::Queued)).await?;
        for task in queued {
            if running_count >= limit {
                break;
            }
            if let Some(&serial_running) = running_types.get(&task.task_type)
                && (!task.parallel_enabled || serial_running)
            {
                debug!(
                    "Task {} waits: {} task of type {} is running",
                    task.id,
                    if serial_running { "a non-parallel" } else { "another" },
                    task.task_type
                );
                continue;
            }
            let Some(executor) = eligible
                .iter()
                .find(|e| e.accepts(&task.task_type) && !busy.contains(e.name()))
                .cloned()
            else {
                debug!("Task {} waits: no idle executor for {}", task.id, task.task_type);
                continue;
            };

            // In flight before the CAS: `cancel` must never find a running
            // task without a token to signal.
            let cancel = CancellationToken::new();
            self.in_flight.lock().await.insert(
                task.id.clone(),
                InFlight {
                    executor: executor.name().to_string(),
                    cancel: cancel.clone(),
                },
            );
            let claimed = self
                .queue
                .transition(
                    &task.id,
                    TaskStatus::Queued,
                    TaskStatus::Running,
                    TransitionPatch::assigned_to(executor.name()),
                )
                .await;
            let won = match claimed {
                Ok(won) => won,
                Err(e) => {
                    self.in_flight.lock().await.remove(&task.id);
                    return Err(e);
                }
            };
            if !won {
                self.in_flight.lock().await.remove(&task.id);
                debug!("Task {} was claimed concurrently, skipping", task.id);
                continue;
            }

            running_count += 1;
            let serial = running_types.entry(task.task_type.clone()).or_insert(false);
            *serial |= !task.parallel_enabled;
            busy.insert(executor.name().to_string());
            report
                .dispatched
                .push((task.id.clone(), executor.name().to_string()));
            self.spawn_execution(task, executor, cancel);
        }
        Ok(report)
    }

    fn spawn_execution(
        self: &Arc<Self>,
        mut task: Task,
        executor: Arc<dyn TaskExecutor>,
        cancel: CancellationToken,
    ) {
        task.status = TaskStatus::Running;
        task.assigned_agent = Some(executor.name().to_string());
        info!("Dispatched task {} to {}", task.id, executor.name());

        let this = self.clone();
        tokio::spawn(async move {
            let report = executor.execute(&task, cancel).await;
            // A task stays in flight until its final status is stored.
            this.complete(&task.id, report).await;
            this.in_flight.lock().await.remove(&task.id);
            this.wake.notify_one();
        });
    }

    async fn complete(&self, id: &str, report: ExecutionReport) {
        let patch = match report.status {
            TaskStatus::Succeeded => TransitionPatch::result(report.summary.clone()),
            _ => TransitionPatch::error(report.summary.clone()),
        };
        match self
            .queue
            .transition(id, TaskStatus::Running, report.status, patch)
            .await
        {
            Ok(true) => {
                info!("Task {} finished: {}", id, report.status);
                match report.status {
                    TaskStatus::Succeeded => self.emit(id, WebhookEvent::TaskCompleted).await,
                    TaskStatus::Failed => self.emit(id, WebhookEvent::TaskFailed).await,
                    _ => {}
                }
            }
            Ok(false) => debug!(
                "Discarding {} result for task {}: already finalised",
                report.status, id
            ),
            Err(e) => error!("Failed to record result of task {}: {}", id, e),
        }
    }

    async fn expire_timed_out(&self, report: &mut TickReport) -> Result<(), StoreError> {
        let now = Utc::now();
        let running = self.queue.list(&TaskFilter::status(TaskStatus::Running)).await?;
        for task in running {
            let Some(started) = task.started_at else {
                continue;
            };
            let timeout = task.effective_timeout(self.config.default_timeout);
            let limit = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
            if now.signed_duration_since(started) <= limit {
                continue;
            }
            let won = self
                .queue
                .transition(
                    &task.id,
                    TaskStatus::Running,
                    TaskStatus::Failed,
                    TransitionPatch::error(format!("timed out after {}s", timeout.as_secs())),
                )
                .await?;
            if !won {
                continue;
            }
            warn!(
                "Task {} timed out after {}s on {}",
                task.id,
                timeout.as_secs(),
                task.assigned_agent.as_deref().unwrap_or("unknown executor")
            );
            if let Some(flight) = self.in_flight.lock().await.get(&task.id) {
                flight.cancel.cancel();
            }
            self.emit(&task.id, WebhookEvent::TaskFailed).await;
            report.timed_out.push(task.id);
        }
        Ok(())
    }

    /// Executors whose agent is neither stale nor degraded. Executors without
    /// a status record are eligible.
    async fn eligible_executors(&self) -> Result<Vec<Arc<dyn TaskExecutor>>, StoreError> {
        let now = Utc::now();
        let records: HashMap<String, _> = self
            .status
            .list()
            .await?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        let mut stale_seen = self.stale_seen.lock().await;
        let mut eligible = Vec::new();
        for executor in &self.executors {
            let name = executor.name();
            match records.get(name) {
                Some(status) if status.is_stale(now) => {
                    if stale_seen.insert(name.to_string()) {
                        warn!(
                            "Agent {} is stale (last heartbeat {})",
                            name, status.last_heartbeat
                        );
                    }
                }
                Some(status) if !status.accepts_dispatch(now) => {
                    stale_seen.remove(name);
                    debug!("Agent {} is {}, not dispatching", name, status.state.as_str());
                }
                _ => {
                    if stale_seen.remove(name) {
                        info!("Agent {} is live again", name);
                    }
                    eligible.push(executor.clone());
                }
            }
        }
        Ok(eligible)
    }

    /// Cancels a queued task outright, or signals a running one.
    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome, StoreError> {
        let task = self
            .queue
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;

        let mut status = task.status;
        if status == TaskStatus::Queued {
            if self
                .queue
                .transition(
                    id,
                    TaskStatus::Queued,
                    TaskStatus::Cancelled,
                    TransitionPatch::error("cancelled before dispatch"),
                )
                .await?
            {
                info!("Task {} cancelled while queued", id);
                return Ok(CancelOutcome::Cancelled);
            }
            status = self
                .queue
                .get(id)
                .await?
                .map(|t| t.status)
                .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        }

        match status {
            TaskStatus::Running => {
                if let Some(flight) = self.in_flight.lock().await.get(id) {
                    flight.cancel.cancel();
                    info!("Cancellation requested for task {} on {}", id, flight.executor);
                    return Ok(CancelOutcome::CancellationRequested);
                }
                // Left running by a previous process: nothing to signal.
                if self
                    .queue
                    .transition(
                        id,
                        TaskStatus::Running,
                        TaskStatus::Cancelled,
                        TransitionPatch::error("cancelled without a live executor"),
                    )
                    .await?
                {
                    return Ok(CancelOutcome::Cancelled);
                }
                Err(StoreError::Conflict(format!("task {} finished meanwhile", id)))
            }
            other => Err(StoreError::Conflict(format!(
                "task {} is already {}",
                id, other
            ))),
        }
    }

    async fn emit(&self, id: &str, event: WebhookEvent) {
        match self.queue.get(id).await {
            Ok(Some(task)) => match serde_json::to_value(&task) {
                Ok(data) => self.webhooks.emit(event, data),
                Err(e) => warn!("Failed to encode task {} for webhooks: {}", id, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to load task {} for webhooks: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests;
