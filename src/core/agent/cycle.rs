use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capability::{Action, Backup, BackupRef, CapabilityError, Outcome, Validate};
use crate::core::tasks::Parameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    Success,
    RolledBack,
    Error,
    Cancelled,
}

impl FinalOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalOutcome::Success => "success",
            FinalOutcome::RolledBack => "rolled_back",
            FinalOutcome::Error => "error",
            FinalOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, FinalOutcome::RolledBack | FinalOutcome::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CyclePhase {
    BackingUp,
    Acting,
    Validating,
    Testing,
    Committing,
    RollingBack,
}

/// The injected collaborators one cycle runs against.
#[derive(Clone)]
pub struct Capabilities {
    pub backup: Option<Arc<dyn Backup>>,
    pub action: Arc<dyn Action>,
    pub validate: Option<Arc<dyn Validate>>,
    pub test: Option<Arc<dyn Validate>>,
}

/// Record of one backup → act → validate → test → commit-or-rollback pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildCycle {
    pub trigger_time: DateTime<Utc>,
    pub subject: String,
    pub backup_ref: Option<BackupRef>,
    pub action_outcome: Option<Outcome>,
    pub validation_outcome: Option<Outcome>,
    pub test_outcome: Option<Outcome>,
    pub final_outcome: FinalOutcome,
    pub detail: String,
}

impl BuildCycle {
    fn start(subject: &str) -> Self {
        Self {
            trigger_time: Utc::now(),
            subject: subject.to_string(),
            backup_ref: None,
            action_outcome: None,
            validation_outcome: None,
            test_outcome: None,
            final_outcome: FinalOutcome::Error,
            detail: String::new(),
        }
    }

    fn finish(mut self, outcome: FinalOutcome, detail: impl Into<String>) -> Self {
        self.final_outcome = outcome;
        self.detail = detail.into();
        self
    }

    /// One-line description with the last diagnostics line of the deciding stage.
    pub fn summary(&self) -> String {
        let last_diag = [
            &self.test_outcome,
            &self.validation_outcome,
            &self.action_outcome,
        ]
        .into_iter()
        .flatten()
        .next()
        .and_then(|o| o.diagnostics.lines().rev().find(|l| !l.trim().is_empty()))
        .map(str::trim);
        match last_diag {
            Some(line) if !line.is_empty() => format!("{}: {}", self.detail, line),
            _ => self.detail.clone(),
        }
    }
}

enum Stage {
    Done(Outcome),
    Failed(CapabilityError),
    Cancelled,
}

async fn guarded<F>(cancel: &CancellationToken, fut: F) -> Stage
where
    F: std::future::Future<Output = Result<Outcome, CapabilityError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Stage::Cancelled,
        res = fut => match res {
            Ok(outcome) => Stage::Done(outcome),
            Err(e) => Stage::Failed(e),
        },
    }
}

/// Runs one cycle for `agent` against `subject`.
///
/// Cancellation is checked before the action and before each validation
/// stage; an in-flight stage is dropped when the token fires. Anything that
/// fails after mutation is restored from the backup when one was taken.
pub async fn run_cycle(
    agent: &str,
    caps: &Capabilities,
    mutating: bool,
    subject: &str,
    params: &Parameters,
    cancel: &CancellationToken,
) -> BuildCycle {
    let mut cycle = BuildCycle::start(subject);
    let runner = Runner { agent, caps };

    if mutating && let Some(backup) = &caps.backup {
        runner.enter(CyclePhase::BackingUp);
        match backup.backup(subject).await {
            Ok(r) => {
                debug!("[{}] Backup {} taken for {}", agent, r.0, subject);
                cycle.backup_ref = Some(r);
            }
            Err(e) => {
                warn!("[{}] Backup of {} failed, skipping cycle: {}", agent, subject, e);
                return cycle.finish(FinalOutcome::Error, format!("backup failed: {}", e));
            }
        }
    }

    if cancel.is_cancelled() {
        return cycle.finish(FinalOutcome::Cancelled, "cancelled before action");
    }

    runner.enter(CyclePhase::Acting);
    match guarded(cancel, caps.action.run(subject, params)).await {
        Stage::Cancelled => return runner.abort(cycle, "cancelled during action").await,
        Stage::Failed(e) => return runner.fail(cycle, format!("action error: {}", e)).await,
        Stage::Done(outcome) => {
            let ok = outcome.ok;
            cycle.action_outcome = Some(outcome);
            if !ok {
                return runner.fail(cycle, "action failed").await;
            }
        }
    }

    for (phase, stage) in [
        (CyclePhase::Validating, &caps.validate),
        (CyclePhase::Testing, &caps.test),
    ] {
        let Some(check) = stage else {
            continue;
        };
        let label = if phase == CyclePhase::Validating {
            "validation"
        } else {
            "tests"
        };
        if cancel.is_cancelled() {
            return runner
                .abort(cycle, format!("cancelled before {}", label))
                .await;
        }
        runner.enter(phase);
        let result = guarded(cancel, check.run(subject)).await;
        let outcome = match result {
            Stage::Cancelled => {
                return runner
                    .abort(cycle, format!("cancelled during {}", label))
                    .await;
            }
            Stage::Failed(e) => {
                return runner.fail(cycle, format!("{} error: {}", label, e)).await;
            }
            Stage::Done(outcome) => outcome,
        };
        let ok = outcome.ok;
        if phase == CyclePhase::Validating {
            cycle.validation_outcome = Some(outcome);
        } else {
            cycle.test_outcome = Some(outcome);
        }
        if !ok {
            return runner.fail(cycle, format!("{} failed", label)).await;
        }
    }

    runner.enter(CyclePhase::Committing);
    cycle.finish(FinalOutcome::Success, "cycle succeeded")
}

struct Runner<'a> {
    agent: &'a str,
    caps: &'a Capabilities,
}

impl Runner<'_> {
    fn enter(&self, phase: CyclePhase) {
        debug!("[{}] Cycle phase: {:?}", self.agent, phase);
    }

    /// Restores when possible; true when the subject is back to its backup.
    async fn restore(&self, cycle: &BuildCycle) -> Result<bool, CapabilityError> {
        let (Some(backup), Some(backup_ref)) = (&self.caps.backup, &cycle.backup_ref) else {
            return Ok(false);
        };
        self.enter(CyclePhase::RollingBack);
        backup.restore(&cycle.subject, backup_ref).await?;
        Ok(true)
    }

    async fn fail(&self, cycle: BuildCycle, reason: impl Into<String>) -> BuildCycle {
        let reason = reason.into();
        match self.restore(&cycle).await {
            Ok(true) => {
                info!("[{}] {}; rolled back {}", self.agent, reason, cycle.subject);
                cycle.finish(FinalOutcome::RolledBack, format!("{}; rolled back", reason))
            }
            Ok(false) => {
                warn!("[{}] {}; no backup to restore", self.agent, reason);
                cycle.finish(FinalOutcome::Error, reason)
            }
            Err(e) => {
                error!(
                    "[{}] {}; restore of {} failed: {}",
                    self.agent, reason, cycle.subject, e
                );
                cycle.finish(FinalOutcome::Error, format!("{}; {}", reason, e))
            }
        }
    }

    async fn abort(&self, cycle: BuildCycle, reason: impl Into<String>) -> BuildCycle {
        let reason = reason.into();
        match self.restore(&cycle).await {
            Ok(restored) => {
                info!(
                    "[{}] {}{}",
                    self.agent,
                    reason,
                    if restored { "; restored backup" } else { "" }
                );
                cycle.finish(FinalOutcome::Cancelled, reason)
            }
            Err(e) => {
                error!(
                    "[{}] {}; restore of {} failed: {}",
                    self.agent, reason, cycle.subject, e
                );
                cycle.finish(FinalOutcome::Error, format!("{}; {}", reason, e))
            }
        }
    }
}
