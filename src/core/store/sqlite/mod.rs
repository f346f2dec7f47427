mod agents;
mod tasks;
mod webhooks;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::StoreError;
use crate::platform::{NativePlatform, Platform};

/// Durable store on a single SQLite database file.
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);
        info!("Opened task store at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS agents (
                name TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                status TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                current_interval INTEGER NOT NULL,
                tasks_completed INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                capabilities TEXT NOT NULL DEFAULT '[]'
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                task_type TEXT NOT NULL,
                target TEXT,
                parameters TEXT NOT NULL DEFAULT '{}',
                priority TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                status TEXT NOT NULL,
                parallel_enabled INTEGER NOT NULL DEFAULT 1,
                timeout_secs INTEGER,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                assigned_agent TEXT,
                result TEXT,
                error TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_dispatch
             ON tasks (status, priority_rank DESC, created_at ASC, seq ASC)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                parallel_mode INTEGER NOT NULL,
                max_concurrent INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO queue_settings (id, parallel_mode, max_concurrent) VALUES (1, 1, 2)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS webhooks (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                events TEXT NOT NULL,
                secret TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                rate_limit INTEGER NOT NULL DEFAULT 100,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        add_column_if_missing(&conn, "webhooks", "rate_limit", "INTEGER NOT NULL DEFAULT 100")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS webhook_deliveries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                webhook_id TEXT NOT NULL,
                event TEXT NOT NULL,
                status TEXT NOT NULL,
                status_code INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL,
                delivered_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_deliveries_webhook
             ON webhook_deliveries (webhook_id, seq DESC)",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Databases created before a column existed get it on open.
fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(());
        }
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
        [],
    )?;
    Ok(())
}

/// Fixed-width UTC form, so lexical order in SQL matches time order.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn decode_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(decode_ts).transpose()
}
