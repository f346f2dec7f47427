use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::time::Duration;

use super::{SqliteStore, decode_ts, encode_ts};
use crate::core::status::{
    AgentLease, AgentState, AgentStatus, StatusStore, apply_heartbeat, merge_upsert,
};
use crate::core::store::StoreError;

const AGENT_COLUMNS: &str = "name, status, last_seen, current_interval, tasks_completed, consecutive_failures, capabilities";

struct AgentRow {
    name: String,
    status: String,
    last_seen: String,
    current_interval: i64,
    tasks_completed: i64,
    consecutive_failures: i64,
    capabilities: String,
}

impl AgentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            status: row.get(1)?,
            last_seen: row.get(2)?,
            current_interval: row.get(3)?,
            tasks_completed: row.get(4)?,
            consecutive_failures: row.get(5)?,
            capabilities: row.get(6)?,
        })
    }

    fn into_status(self) -> Result<AgentStatus, StoreError> {
        let state = AgentState::from_state(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown agent state '{}'", self.status)))?;
        Ok(AgentStatus {
            name: self.name,
            state,
            last_heartbeat: decode_ts(&self.last_seen)?,
            current_interval: self.current_interval.max(0) as u64,
            tasks_completed: self.tasks_completed.max(0) as u64,
            consecutive_failures: self.consecutive_failures.max(0) as u32,
            capabilities: serde_json::from_str(&self.capabilities)?,
        })
    }
}

fn load_owned(
    db: &Connection,
    lease: &AgentLease,
) -> Result<AgentStatus, StoreError> {
    let row = db
        .query_row(
            &format!("SELECT token, {} FROM agents WHERE name = ?1", AGENT_COLUMNS),
            params![lease.name],
            |row| {
                let token: String = row.get(0)?;
                let rest = AgentRow {
                    name: row.get(1)?,
                    status: row.get(2)?,
                    last_seen: row.get(3)?,
                    current_interval: row.get(4)?,
                    tasks_completed: row.get(5)?,
                    consecutive_failures: row.get(6)?,
                    capabilities: row.get(7)?,
                };
                Ok((token, rest))
            },
        )
        .optional()?;
    let (token, row) = row.ok_or_else(|| StoreError::NotFound(format!("agent '{}'", lease.name)))?;
    if token != lease.token {
        return Err(StoreError::NotOwner(lease.name.clone()));
    }
    row.into_status()
}

fn write_status(db: &Connection, status: &AgentStatus) -> Result<(), StoreError> {
    db.execute(
        "UPDATE agents SET status = ?1, last_seen = ?2, current_interval = ?3,
            tasks_completed = ?4, consecutive_failures = ?5, capabilities = ?6
         WHERE name = ?7",
        params![
            status.state.as_str(),
            encode_ts(status.last_heartbeat),
            status.current_interval as i64,
            status.tasks_completed as i64,
            status.consecutive_failures as i64,
            serde_json::to_string(&status.capabilities)?,
            status.name,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn claim(
        &self,
        name: &str,
        capabilities: &[String],
        initial_interval: Duration,
    ) -> Result<(AgentLease, AgentStatus), StoreError> {
        let db = self.db.lock().await;
        let lease = AgentLease::issue(name);
        let existing = db
            .query_row(
                &format!("SELECT {} FROM agents WHERE name = ?1", AGENT_COLUMNS),
                params![name],
                AgentRow::from_row,
            )
            .optional()?;

        let status = match existing {
            Some(row) => {
                let mut status = row.into_status()?;
                status.capabilities = capabilities.to_vec();
                db.execute(
                    "UPDATE agents SET token = ?1, capabilities = ?2 WHERE name = ?3",
                    params![lease.token, serde_json::to_string(&status.capabilities)?, name],
                )?;
                status
            }
            None => {
                let status = AgentStatus::new(name, capabilities.to_vec(), initial_interval);
                db.execute(
                    "INSERT INTO agents (name, token, status, last_seen, current_interval, capabilities)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        name,
                        lease.token,
                        status.state.as_str(),
                        encode_ts(status.last_heartbeat),
                        status.current_interval as i64,
                        serde_json::to_string(&status.capabilities)?,
                    ],
                )?;
                status
            }
        };
        Ok((lease, status))
    }

    async fn get(&self, name: &str) -> Result<Option<AgentStatus>, StoreError> {
        let db = self.db.lock().await;
        db.query_row(
            &format!("SELECT {} FROM agents WHERE name = ?1", AGENT_COLUMNS),
            params![name],
            AgentRow::from_row,
        )
        .optional()?
        .map(AgentRow::into_status)
        .transpose()
    }

    async fn list(&self) -> Result<Vec<AgentStatus>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agents ORDER BY name ASC",
            AGENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], AgentRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_status()?);
        }
        Ok(out)
    }

    async fn upsert(&self, lease: &AgentLease, status: &AgentStatus) -> Result<(), StoreError> {
        if status.name != lease.name {
            return Err(StoreError::NotOwner(status.name.clone()));
        }
        let db = self.db.lock().await;
        let existing = load_owned(&db, lease)?;
        write_status(&db, &merge_upsert(Some(&existing), status))
    }

    async fn heartbeat(
        &self,
        lease: &AgentLease,
        at: DateTime<Utc>,
    ) -> Result<AgentStatus, StoreError> {
        let db = self.db.lock().await;
        let mut status = load_owned(&db, lease)?;
        apply_heartbeat(&mut status, at);
        write_status(&db, &status)?;
        Ok(status)
    }
}
