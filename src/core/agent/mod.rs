mod capability;
mod command;
mod cycle;
mod interval;
mod snapshot;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::orchestrator::{ExecutionReport, TaskExecutor};
use crate::core::status::{AgentLease, AgentState, AgentStatus, StatusStore};
use crate::core::store::StoreError;
use crate::core::tasks::{Parameters, Task};

pub use capability::{Action, Backup, BackupRef, CapabilityError, Outcome, Validate};
pub use command::{CommandAction, CommandValidate};
pub use cycle::{BuildCycle, Capabilities, FinalOutcome, run_cycle};
pub use interval::{IntervalError, IntervalPolicy};
pub use snapshot::SnapshotBackup;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(300);
pub const DEFAULT_DEGRADE_AFTER: u32 = 3;

/// Static description of one agent.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: String,
    /// Default subject of periodic cycles (usually a directory).
    pub subject: String,
    /// Task types this agent executes for the orchestrator.
    pub task_types: Vec<String>,
    pub mutating: bool,
    pub policy: IntervalPolicy,
    pub heartbeat: Duration,
    pub degrade_after: u32,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            task_types: Vec::new(),
            mutating: true,
            policy: IntervalPolicy::default(),
            heartbeat: DEFAULT_HEARTBEAT,
            degrade_after: DEFAULT_DEGRADE_AFTER,
        }
    }

    pub fn with_task_types(mut self, types: &[&str]) -> Self {
        self.task_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_policy(mut self, policy: IntervalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.mutating = false;
        self
    }
}

/// Folds a finished cycle into the agent's counters and interval.
pub(crate) fn apply_outcome(
    status: &mut AgentStatus,
    spec: &AgentSpec,
    outcome: FinalOutcome,
    now: DateTime<Utc>,
) {
    match outcome {
        FinalOutcome::Success => {
            status.consecutive_failures = 0;
            status.tasks_completed += 1;
            status.state = AgentState::Active;
        }
        FinalOutcome::RolledBack | FinalOutcome::Error => {
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            status.state = if status.consecutive_failures >= spec.degrade_after {
                AgentState::Degraded
            } else {
                AgentState::Failed
            };
        }
        FinalOutcome::Cancelled => {}
    }
    status.current_interval = spec.policy.next(status.interval(), outcome).as_secs();
    if now > status.last_heartbeat {
        status.last_heartbeat = now;
    }
}

/// Supervised action/sleep loop for one agent. Also executes orchestrated
/// tasks of the agent's types, serialised with the periodic cycle.
pub struct AgentRuntime {
    spec: AgentSpec,
    caps: Capabilities,
    store: Arc<dyn StatusStore>,
    lease: AgentLease,
    cycle_lock: Mutex<()>,
    status: Mutex<AgentStatus>,
    superseded: AtomicBool,
}

impl AgentRuntime {
    /// Claims the agent's status record, resuming interval and counters when
    /// one already exists.
    pub async fn start(
        spec: AgentSpec,
        caps: Capabilities,
        store: Arc<dyn StatusStore>,
    ) -> Result<Arc<Self>, StoreError> {
        let (lease, mut status) = store
            .claim(&spec.name, &spec.task_types, spec.policy.initial())
            .await?;
        status.current_interval = spec.policy.clamp(status.interval()).as_secs();
        info!(
            "[{}] Claimed status record (interval {}s, {} completed, {} consecutive failures)",
            spec.name, status.current_interval, status.tasks_completed, status.consecutive_failures
        );
        Ok(Arc::new(Self {
            spec,
            caps,
            store,
            lease,
            cycle_lock: Mutex::new(()),
            status: Mutex::new(status),
            superseded: AtomicBool::new(false),
        }))
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub async fn status(&self) -> AgentStatus {
        self.status.lock().await.clone()
    }

    /// Loops until `cancel` fires or another process claims the same name.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("[{}] Agent runtime started", self.spec.name);
        self.beat().await;
        while !cancel.is_cancelled() && !self.is_superseded() {
            let subject = self.spec.subject.clone();
            self.execute_cycle(&subject, &Parameters::default(), &cancel)
                .await;
            if self.is_superseded() {
                break;
            }
            let interval = self.status.lock().await.interval();
            if !self.sleep_with_heartbeats(interval, &cancel).await {
                break;
            }
        }
        info!("[{}] Agent runtime stopped", self.spec.name);
    }

    fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    async fn execute_cycle(
        &self,
        subject: &str,
        params: &Parameters,
        cancel: &CancellationToken,
    ) -> BuildCycle {
        let _serial = self.cycle_lock.lock().await;
        let cycle = run_cycle(
            &self.spec.name,
            &self.caps,
            self.spec.mutating,
            subject,
            params,
            cancel,
        )
        .await;

        let snapshot = {
            let mut status = self.status.lock().await;
            let before = status.current_interval;
            apply_outcome(&mut status, &self.spec, cycle.final_outcome, Utc::now());
            info!(
                "[{}] Cycle on {} finished: {} (interval {}s -> {}s)",
                self.spec.name,
                subject,
                cycle.final_outcome.as_str(),
                before,
                status.current_interval
            );
            if status.state == AgentState::Degraded && cycle.final_outcome.is_failure() {
                warn!(
                    "[{}] Degraded after {} consecutive failures",
                    self.spec.name, status.consecutive_failures
                );
            }
            status.clone()
        };
        if let Err(e) = self.store.upsert(&self.lease, &snapshot).await {
            self.on_store_error("status update", e);
        }
        cycle
    }

    async fn beat(&self) {
        match self.store.heartbeat(&self.lease, Utc::now()).await {
            Ok(stored) => {
                let mut status = self.status.lock().await;
                status.last_heartbeat = stored.last_heartbeat;
                status.state = stored.state;
                debug!("[{}] Heartbeat", self.spec.name);
            }
            Err(e) => self.on_store_error("heartbeat", e),
        }
    }

    fn on_store_error(&self, what: &str, err: StoreError) {
        match err {
            StoreError::NotOwner(_) => {
                error!(
                    "[{}] Status record claimed by another runtime, stopping",
                    self.spec.name
                );
                self.superseded.store(true, Ordering::SeqCst);
            }
            other => warn!("[{}] {} failed: {}", self.spec.name, what, other),
        }
    }

    /// Sleeps for `total`, heartbeating every `min(heartbeat, total)`.
    /// Returns false when the loop should stop.
    async fn sleep_with_heartbeats(&self, total: Duration, cancel: &CancellationToken) -> bool {
        let every = self.spec.heartbeat.min(total).max(Duration::from_millis(10));
        let deadline = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let nap = every.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(nap) => {}
            }
            self.beat().await;
            if self.is_superseded() {
                return false;
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for AgentRuntime {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn accepts(&self, task_type: &str) -> bool {
        self.spec.task_types.iter().any(|t| t == task_type)
    }

    async fn execute(&self, task: &Task, cancel: CancellationToken) -> ExecutionReport {
        let subject = task
            .target
            .clone()
            .unwrap_or_else(|| self.spec.subject.clone());
        info!(
            "[{}] Executing task {} ({}) on {}",
            self.spec.name, task.id, task.task_type, subject
        );
        let cycle = self
            .execute_cycle(&subject, &task.parameters, &cancel)
            .await;
        ExecutionReport::from_cycle(&cycle)
    }
}
