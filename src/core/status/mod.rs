use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::core::store::StoreError;

/// Number of intervals an agent may stay silent before it is considered stale.
pub const STALE_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Active,
    Degraded,
    Failed,
    /// Derived on read, never stored.
    Stale,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Active => "active",
            AgentState::Degraded => "degraded",
            AgentState::Failed => "failed",
            AgentState::Stale => "stale",
        }
    }

    pub fn from_state(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(AgentState::Idle),
            "active" => Some(AgentState::Active),
            "degraded" => Some(AgentState::Degraded),
            "failed" => Some(AgentState::Failed),
            "stale" => Some(AgentState::Stale),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AgentStatus {
    pub name: String,
    #[serde(rename = "status")]
    pub state: AgentState,
    #[serde(rename = "last_seen")]
    pub last_heartbeat: DateTime<Utc>,
    /// Current sleep interval in seconds.
    pub current_interval: u64,
    pub tasks_completed: u64,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentStatus {
    pub fn new(name: impl Into<String>, capabilities: Vec<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            state: AgentState::Idle,
            last_heartbeat: Utc::now(),
            current_interval: interval.as_secs(),
            tasks_completed: 0,
            consecutive_failures: 0,
            capabilities,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.current_interval)
    }

    /// Stale iff `now - last_heartbeat > 3 * current_interval`; the boundary itself is live.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let silence = now.signed_duration_since(self.last_heartbeat);
        let allowance = chrono::Duration::seconds(self.current_interval as i64 * STALE_FACTOR as i64);
        silence > allowance
    }

    pub fn effective_state(&self, now: DateTime<Utc>) -> AgentState {
        if self.is_stale(now) {
            AgentState::Stale
        } else {
            self.state
        }
    }

    /// Whether the orchestrator may hand new work to this agent.
    pub fn accepts_dispatch(&self, now: DateTime<Utc>) -> bool {
        !matches!(
            self.effective_state(now),
            AgentState::Stale | AgentState::Degraded
        )
    }

    /// Copy with the derived state filled in, for the read path.
    pub fn observed(&self, now: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.state = self.effective_state(now);
        copy
    }
}

/// Proof of ownership of one status record. Only the holder may write it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AgentLease {
    pub name: String,
    pub token: String,
}

impl AgentLease {
    pub(crate) fn issue(name: &str) -> Self {
        let bytes: [u8; 16] = rand::random();
        Self {
            name: name.to_string(),
            token: format!("agl_{}", hex::encode(bytes)),
        }
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Claims the record for `name`, creating it when absent. Claiming again
    /// rotates the lease, so a restarted owner supersedes the previous one.
    async fn claim(
        &self,
        name: &str,
        capabilities: &[String],
        initial_interval: Duration,
    ) -> Result<(AgentLease, AgentStatus), StoreError>;

    async fn get(&self, name: &str) -> Result<Option<AgentStatus>, StoreError>;

    async fn list(&self) -> Result<Vec<AgentStatus>, StoreError>;

    /// Full write by the owner. `last_heartbeat` never moves backwards.
    async fn upsert(&self, lease: &AgentLease, status: &AgentStatus) -> Result<(), StoreError>;

    /// Liveness only: bumps `last_heartbeat` and marks the agent active,
    /// clearing `degraded`. Never touches the interval or the counters.
    async fn heartbeat(&self, lease: &AgentLease, at: DateTime<Utc>) -> Result<AgentStatus, StoreError>;
}

/// Merge rule shared by the store implementations.
pub(crate) fn merge_upsert(existing: Option<&AgentStatus>, incoming: &AgentStatus) -> AgentStatus {
    let mut next = incoming.clone();
    if next.state == AgentState::Stale {
        next.state = existing.map(|e| e.state).unwrap_or(AgentState::Idle);
    }
    if let Some(existing) = existing
        && existing.last_heartbeat > next.last_heartbeat
    {
        next.last_heartbeat = existing.last_heartbeat;
    }
    next
}

pub(crate) fn apply_heartbeat(status: &mut AgentStatus, at: DateTime<Utc>) {
    if at > status.last_heartbeat {
        status.last_heartbeat = at;
    }
    status.state = AgentState::Active;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_at(last: DateTime<Utc>, interval: u64) -> AgentStatus {
        let mut s = AgentStatus::new("scanner", vec![], Duration::from_secs(interval));
        s.last_heartbeat = last;
        s.state = AgentState::Active;
        s
    }

    #[test]
    fn stale_boundary_is_exclusive() {
        let t0 = Utc::now();
        let s = status_at(t0, 100);
        assert!(!s.is_stale(t0 + chrono::Duration::seconds(299)));
        assert!(!s.is_stale(t0 + chrono::Duration::seconds(300)));
        assert!(s.is_stale(t0 + chrono::Duration::seconds(300) + chrono::Duration::milliseconds(1)));
        assert_eq!(
            s.effective_state(t0 + chrono::Duration::seconds(301)),
            AgentState::Stale
        );
    }

    #[test]
    fn degraded_and_stale_agents_are_not_dispatchable() {
        let t0 = Utc::now();
        let mut s = status_at(t0, 60);
        assert!(s.accepts_dispatch(t0));
        s.state = AgentState::Degraded;
        assert!(!s.accepts_dispatch(t0));
        s.state = AgentState::Failed;
        assert!(s.accepts_dispatch(t0));
        assert!(!s.accepts_dispatch(t0 + chrono::Duration::seconds(181)));
    }

    #[test]
    fn upsert_never_rewinds_heartbeat() {
        let t0 = Utc::now();
        let existing = status_at(t0, 60);
        let mut incoming = existing.clone();
        incoming.last_heartbeat = t0 - chrono::Duration::seconds(30);
        incoming.tasks_completed = 4;
        let merged = merge_upsert(Some(&existing), &incoming);
        assert_eq!(merged.last_heartbeat, t0);
        assert_eq!(merged.tasks_completed, 4);
    }

    #[test]
    fn stale_is_never_persisted() {
        let t0 = Utc::now();
        let existing = status_at(t0, 60);
        let mut incoming = existing.clone();
        incoming.state = AgentState::Stale;
        assert_eq!(merge_upsert(Some(&existing), &incoming).state, AgentState::Active);
    }

    #[test]
    fn heartbeat_clears_degraded_and_keeps_interval() {
        let t0 = Utc::now();
        let mut s = status_at(t0, 120);
        s.state = AgentState::Degraded;
        s.consecutive_failures = 3;
        assert!(!s.accepts_dispatch(t0));
        apply_heartbeat(&mut s, t0 + chrono::Duration::seconds(10));
        assert_eq!(s.state, AgentState::Active);
        assert!(s.accepts_dispatch(t0 + chrono::Duration::seconds(10)));
        assert_eq!(s.current_interval, 120);
        assert_eq!(s.consecutive_failures, 3);
        assert_eq!(s.last_heartbeat, t0 + chrono::Duration::seconds(10));

        s.state = AgentState::Failed;
        apply_heartbeat(&mut s, t0);
        assert_eq!(s.state, AgentState::Active);
        assert_eq!(s.last_heartbeat, t0 + chrono::Duration::seconds(10));
    }
}
