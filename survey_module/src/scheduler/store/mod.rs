use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::sqlite_util::{format_datetime, parse_datetime, parse_optional_datetime};

use super::types::{DeferredTask, SchedulerError, TaskExecutionRecord, TaskKind, TaskStatus};

mod migrations;
mod schema;

use migrations::ensure_deferred_task_columns;
use schema::SCHEDULER_SCHEMA;

const TASK_COLUMNS: &str =
    "id, payload, fire_at, status, attempt_count, created_at, last_run, last_error, retry_at";

// A pending task becomes runnable at the later of its fire time and its retry time.
const READY_AT: &str = "max(fire_at, COALESCE(retry_at, fire_at))";

type RawTask = (
    String,
    String,
    String,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// Result of persisting a schedule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Upserted {
    pub(crate) task_id: Uuid,
    pub(crate) superseded: bool,
}

#[derive(Debug)]
pub(crate) struct SqliteTaskStore {
    path: PathBuf,
}

impl SqliteTaskStore {
    pub(crate) fn new(path: PathBuf) -> Result<Self, SchedulerError> {
        let store = Self { path };
        let _ = store.open()?;
        Ok(store)
    }

    /// Inserts a pending task, or moves the pending task with the same kind
    /// and payload to `fire_at`.
    pub(crate) fn upsert_pending(
        &self,
        kind: &TaskKind,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Upserted, SchedulerError> {
        let payload = kind.payload()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = tx
            .query_row(
                "SELECT id FROM deferred_tasks
                 WHERE kind = ?1 AND payload = ?2 AND status = 'pending'
                 LIMIT 1",
                params![kind.label(), payload],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        let upserted = match existing {
            Some(id_raw) => {
                tx.execute(
                    "UPDATE deferred_tasks
                     SET fire_at = ?1,
                         attempt_count = 0,
                         last_error = NULL,
                         retry_at = NULL
                     WHERE id = ?2",
                    params![format_datetime(fire_at), id_raw],
                )?;
                Upserted {
                    task_id: Uuid::parse_str(&id_raw)?,
                    superseded: true,
                }
            }
            None => {
                let task_id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO deferred_tasks (id, kind, payload, fire_at, status, attempt_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)",
                    params![
                        task_id.to_string(),
                        kind.label(),
                        payload,
                        format_datetime(fire_at),
                        format_datetime(now),
                    ],
                )?;
                Upserted {
                    task_id,
                    superseded: false,
                }
            }
        };
        tx.commit()?;
        Ok(upserted)
    }

    pub(crate) fn load_task(&self, id: Uuid) -> Result<Option<DeferredTask>, SchedulerError> {
        let conn = self.open()?;
        let raw = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM deferred_tasks WHERE id = ?1"),
                params![id.to_string()],
                read_task_columns,
            )
            .optional()?;
        raw.map(task_from_raw).transpose()
    }

    pub(crate) fn pending_tasks(&self) -> Result<Vec<DeferredTask>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM deferred_tasks
             WHERE status = 'pending'
             ORDER BY fire_at, created_at"
        ))?;
        let rows = stmt.query_map([], read_task_columns)?;
        collect_tasks(rows)
    }

    pub(crate) fn due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeferredTask>, SchedulerError> {
        let conn = self.open()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM deferred_tasks
             WHERE status = 'pending' AND {READY_AT} <= ?1
             ORDER BY {READY_AT}, created_at
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![format_datetime(now), limit], read_task_columns)?;
        collect_tasks(rows)
    }

    /// Earliest time after `now` at which a pending task becomes runnable,
    /// counting retry backoff.
    pub(crate) fn next_future_ready_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let conn = self.open()?;
        let raw: Option<String> = conn.query_row(
            &format!(
                "SELECT MIN({READY_AT}) FROM deferred_tasks
                 WHERE status = 'pending' AND {READY_AT} > ?1"
            ),
            params![format_datetime(now)],
            |row| row.get(0),
        )?;
        Ok(parse_optional_datetime(raw.as_deref())?)
    }

    /// Marks the task fired unless it was moved to another time meanwhile.
    pub(crate) fn mark_fired(
        &self,
        id: Uuid,
        expected_fire_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE deferred_tasks
             SET status = 'fired',
                 last_run = ?1,
                 last_error = NULL,
                 retry_at = NULL
             WHERE id = ?2 AND status = 'pending' AND fire_at = ?3",
            params![
                format_datetime(at),
                id.to_string(),
                format_datetime(expected_fire_at)
            ],
        )?;
        Ok(updated > 0)
    }

    /// Counts a failed attempt. A task that stays pending is held back until
    /// `retry_at`. Returns the resulting status, or `None` when the task was
    /// moved while it ran.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record_failure(
        &self,
        id: Uuid,
        expected_fire_at: DateTime<Utc>,
        at: DateTime<Utc>,
        error_message: &str,
        permanent: bool,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<TaskStatus>, SchedulerError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE deferred_tasks
             SET attempt_count = attempt_count + 1,
                 last_run = ?1,
                 last_error = ?2,
                 status = CASE
                     WHEN ?3 = 1 OR attempt_count + 1 >= ?4 THEN 'failed_permanently'
                     ELSE 'pending'
                 END,
                 retry_at = CASE
                     WHEN ?3 = 1 OR attempt_count + 1 >= ?4 THEN NULL
                     ELSE ?7
                 END
             WHERE id = ?5 AND status = 'pending' AND fire_at = ?6",
            params![
                format_datetime(at),
                error_message,
                i64::from(permanent),
                i64::from(max_attempts),
                id.to_string(),
                format_datetime(expected_fire_at),
                format_datetime(retry_at),
            ],
        )?;
        let status = if updated == 0 {
            None
        } else {
            let raw: String = tx.query_row(
                "SELECT status FROM deferred_tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            Some(TaskStatus::parse(&raw)?)
        };
        tx.commit()?;
        Ok(status)
    }

    pub(crate) fn record_execution_start(
        &self,
        task_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<i64, SchedulerError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO task_executions (task_id, started_at, status)
             VALUES (?1, ?2, 'running')",
            params![task_id.to_string(), format_datetime(started_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub(crate) fn record_execution_finish(
        &self,
        execution_id: i64,
        finished_at: DateTime<Utc>,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE task_executions
             SET finished_at = ?1,
                 status = ?2,
                 error_message = ?3
             WHERE id = ?4",
            params![
                format_datetime(finished_at),
                status,
                error_message,
                execution_id
            ],
        )?;
        Ok(())
    }

    pub(crate) fn executions(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<TaskExecutionRecord>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT started_at, finished_at, status, error_message
             FROM task_executions
             WHERE task_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (started_raw, finished_raw, status, error_message) = row?;
            records.push(TaskExecutionRecord {
                task_id,
                started_at: parse_datetime(&started_raw)?,
                finished_at: parse_optional_datetime(finished_raw.as_deref())?,
                status,
                error_message,
            });
        }
        Ok(records)
    }

    fn open(&self) -> Result<Connection, SchedulerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEDULER_SCHEMA)?;
        ensure_deferred_task_columns(&conn)?;
        Ok(conn)
    }
}

fn read_task_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn collect_tasks(
    rows: impl Iterator<Item = rusqlite::Result<RawTask>>,
) -> Result<Vec<DeferredTask>, SchedulerError> {
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(task_from_raw(row?)?);
    }
    Ok(tasks)
}

fn task_from_raw(raw: RawTask) -> Result<DeferredTask, SchedulerError> {
    let (
        id_raw,
        payload,
        fire_at_raw,
        status_raw,
        attempt_count,
        created_raw,
        last_run,
        last_error,
        retry_at,
    ) = raw;
    let kind: TaskKind = serde_json::from_str(&payload).map_err(|err| {
        SchedulerError::Storage(format!("bad payload for task {}: {}", id_raw, err))
    })?;
    Ok(DeferredTask {
        id: Uuid::parse_str(&id_raw)?,
        kind,
        fire_at: parse_datetime(&fire_at_raw)?,
        status: TaskStatus::parse(&status_raw)?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        created_at: parse_datetime(&created_raw)?,
        last_run: parse_optional_datetime(last_run.as_deref())?,
        last_error,
        retry_at: parse_optional_datetime(retry_at.as_deref())?,
    })
}
