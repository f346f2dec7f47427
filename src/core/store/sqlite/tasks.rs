use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::{SqliteStore, decode_opt_ts, decode_ts, encode_ts};
use crate::core::store::{StoreError, check_enqueue};
use crate::core::tasks::{
    Parameters, Priority, QueueSettings, Task, TaskFilter, TaskQueue, TaskStatus, TransitionPatch,
    can_transition,
};

const TASK_COLUMNS: &str = "seq, id, task_type, target, parameters, priority, status, parallel_enabled, timeout_secs, created_at, started_at, completed_at, assigned_agent, result, error";

struct TaskRow {
    seq: i64,
    id: String,
    task_type: String,
    target: Option<String>,
    parameters: String,
    priority: String,
    status: String,
    parallel_enabled: bool,
    timeout_secs: Option<i64>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    assigned_agent: Option<String>,
    result: Option<String>,
    error: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            task_type: row.get(2)?,
            target: row.get(3)?,
            parameters: row.get(4)?,
            priority: row.get(5)?,
            status: row.get(6)?,
            parallel_enabled: row.get::<_, i64>(7)? != 0,
            timeout_secs: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
            assigned_agent: row.get(12)?,
            result: row.get(13)?,
            error: row.get(14)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let priority = Priority::from_name(&self.priority)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown priority '{}'", self.priority)))?;
        let status = TaskStatus::from_status(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown task status '{}'", self.status)))?;
        let parameters: Parameters = serde_json::from_str(&self.parameters)?;
        let timeout_override = self
            .timeout_secs
            .map(u64::try_from)
            .transpose()
            .map_err(|_| StoreError::Corrupt(format!("negative timeout on task {}", self.id)))?;
        Ok(Task {
            id: self.id,
            task_type: self.task_type,
            target: self.target,
            parameters,
            priority,
            status,
            parallel_enabled: self.parallel_enabled,
            timeout_override,
            created_at: decode_ts(&self.created_at)?,
            seq: self.seq.max(0) as u64,
            started_at: decode_opt_ts(self.started_at)?,
            completed_at: decode_opt_ts(self.completed_at)?,
            assigned_agent: self.assigned_agent,
            result: self.result,
            error: self.error,
        })
    }
}

#[async_trait]
impl TaskQueue for SqliteStore {
    async fn enqueue(&self, mut task: Task) -> Result<Task, StoreError> {
        check_enqueue(&task)?;
        let timeout = task
            .timeout_override
            .map(i64::try_from)
            .transpose()
            .map_err(|_| StoreError::Invalid(format!("timeout of task {} is out of range", task.id)))?;
        let db = self.db.lock().await;
        let exists: bool = db.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            params![task.id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        db.execute(
            "INSERT INTO tasks (id, task_type, target, parameters, priority, priority_rank, status,
                parallel_enabled, timeout_secs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id,
                task.task_type,
                task.target,
                serde_json::to_string(&task.parameters)?,
                task.priority.as_str(),
                task.priority.rank(),
                task.status.as_str(),
                task.parallel_enabled as i64,
                timeout,
                encode_ts(task.created_at),
            ],
        )?;
        task.seq = db.last_insert_rowid().max(0) as u64;
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let db = self.db.lock().await;
        db.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            TaskRow::from_row,
        )
        .optional()?
        .map(TaskRow::into_task)
        .transpose()
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM tasks
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR task_type = ?2)
             ORDER BY priority_rank DESC, created_at ASC, seq ASC
             LIMIT ?3",
            TASK_COLUMNS
        ))?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![
                filter.status.map(|s| s.as_str()),
                filter.task_type.as_deref(),
                limit
            ],
            TaskRow::from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_task()?);
        }
        Ok(out)
    }

    async fn transition(
        &self,
        id: &str,
        expected: TaskStatus,
        new: TaskStatus,
        patch: TransitionPatch,
    ) -> Result<bool, StoreError> {
        if !can_transition(expected, new) {
            return Err(StoreError::Conflict(format!(
                "illegal transition {} -> {}",
                expected, new
            )));
        }
        let now = encode_ts(Utc::now());
        let started_at = (new == TaskStatus::Running).then(|| now.clone());
        let completed_at = new.is_terminal().then(|| now.clone());

        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE tasks SET status = ?1,
                started_at = COALESCE(?2, started_at),
                completed_at = COALESCE(?3, completed_at),
                assigned_agent = COALESCE(?4, assigned_agent),
                result = COALESCE(?5, result),
                error = COALESCE(?6, error)
             WHERE id = ?7 AND status = ?8",
            params![
                new.as_str(),
                started_at,
                completed_at,
                patch.assigned_agent,
                patch.result,
                patch.error,
                id,
                expected.as_str(),
            ],
        )?;
        if changed > 0 {
            return Ok(true);
        }
        let exists: bool = db.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound(format!("task {}", id)))
        }
    }

    async fn settings(&self) -> Result<QueueSettings, StoreError> {
        let db = self.db.lock().await;
        let (parallel_mode, max_concurrent): (i64, i64) = db.query_row(
            "SELECT parallel_mode, max_concurrent FROM queue_settings WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(QueueSettings {
            parallel_mode: parallel_mode != 0,
            max_concurrent: max_concurrent.max(1) as usize,
        })
    }

    async fn update_settings(&self, settings: QueueSettings) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO queue_settings (id, parallel_mode, max_concurrent) VALUES (1, ?1, ?2)",
            params![settings.parallel_mode as i64, settings.max_concurrent as i64],
        )?;
        Ok(())
    }
}
