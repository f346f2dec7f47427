//! In-memory capability fakes shared by the agent and orchestrator tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::capability::{Action, Backup, BackupRef, CapabilityError, Outcome, Validate};
use crate::core::tasks::Parameters;

/// Observable state a cycle mutates.
#[derive(Clone)]
pub struct Workspace(Arc<Mutex<String>>);

impl Workspace {
    pub fn new(initial: &str) -> Self {
        Self(Arc::new(Mutex::new(initial.to_string())))
    }

    pub fn read(&self) -> String {
        self.0.lock().unwrap().clone()
    }

    pub fn write(&self, value: &str) {
        *self.0.lock().unwrap() = value.to_string();
    }
}

pub struct FakeBackup {
    ws: Workspace,
    snapshots: Mutex<HashMap<String, String>>,
    fail_backup: bool,
    fail_restore: bool,
}

impl FakeBackup {
    pub fn new(ws: Workspace) -> Self {
        Self {
            ws,
            snapshots: Mutex::new(HashMap::new()),
            fail_backup: false,
            fail_restore: false,
        }
    }

    pub fn failing_backup(mut self) -> Self {
        self.fail_backup = true;
        self
    }

    pub fn failing_restore(mut self) -> Self {
        self.fail_restore = true;
        self
    }
}

#[async_trait]
impl Backup for FakeBackup {
    async fn backup(&self, _subject: &str) -> Result<BackupRef, CapabilityError> {
        if self.fail_backup {
            return Err(CapabilityError::Backup("disk full".into()));
        }
        let mut snapshots = self.snapshots.lock().unwrap();
        let id = format!("snap-{}", snapshots.len());
        snapshots.insert(id.clone(), self.ws.read());
        Ok(BackupRef(id))
    }

    async fn restore(&self, _subject: &str, backup: &BackupRef) -> Result<(), CapabilityError> {
        if self.fail_restore {
            return Err(CapabilityError::Restore("archive corrupt".into()));
        }
        let value = self
            .snapshots
            .lock()
            .unwrap()
            .get(&backup.0)
            .cloned()
            .ok_or_else(|| CapabilityError::Restore("unknown snapshot".into()))?;
        self.ws.write(&value);
        Ok(())
    }
}

enum ActionMode {
    Writes(Workspace, String, bool),
    Reports(bool, String),
}

pub struct FakeAction {
    mode: ActionMode,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FakeAction {
    pub fn writes(ws: &Workspace, value: &str) -> Self {
        Self::with_mode(ActionMode::Writes(ws.clone(), value.to_string(), true))
    }

    pub fn fails_after_writing(ws: &Workspace, value: &str) -> Self {
        Self::with_mode(ActionMode::Writes(ws.clone(), value.to_string(), false))
    }

    pub fn reports(ok: bool, diagnostics: &str) -> Self {
        Self::with_mode(ActionMode::Reports(ok, diagnostics.to_string()))
    }

    fn with_mode(mode: ActionMode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleeps after mutating, leaving a window for cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Action for FakeAction {
    async fn run(&self, _subject: &str, _params: &Parameters) -> Result<Outcome, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = match &self.mode {
            ActionMode::Writes(ws, value, ok) => {
                ws.write(value);
                if *ok {
                    Outcome::success(format!("wrote {}", value))
                } else {
                    Outcome::failure("exit status: 1")
                }
            }
            ActionMode::Reports(ok, diag) => Outcome {
                ok: *ok,
                diagnostics: diag.clone(),
            },
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(outcome)
    }
}

pub struct FakeValidate {
    ok: bool,
    diagnostics: String,
    calls: Arc<AtomicUsize>,
}

impl FakeValidate {
    pub fn passing() -> Self {
        Self {
            ok: true,
            diagnostics: "ok".into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(diagnostics: &str) -> Self {
        Self {
            ok: false,
            diagnostics: diagnostics.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Validate for FakeValidate {
    async fn run(&self, _subject: &str) -> Result<Outcome, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome {
            ok: self.ok,
            diagnostics: self.diagnostics.clone(),
        })
    }
}
