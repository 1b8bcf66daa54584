use std::collections::HashSet;

use rusqlite::Connection;

use super::super::types::SchedulerError;

// Databases created before failure tracking lack the retry columns.
pub(super) fn ensure_deferred_task_columns(conn: &Connection) -> Result<(), SchedulerError> {
    let mut stmt = conn.prepare("PRAGMA table_info(deferred_tasks)")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = HashSet::new();
    for row in rows {
        columns.insert(row?);
    }

    if !columns.contains("attempt_count") {
        conn.execute(
            "ALTER TABLE deferred_tasks ADD COLUMN attempt_count INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !columns.contains("last_run") {
        conn.execute("ALTER TABLE deferred_tasks ADD COLUMN last_run TEXT", [])?;
    }
    if !columns.contains("last_error") {
        conn.execute("ALTER TABLE deferred_tasks ADD COLUMN last_error TEXT", [])?;
    }
    if !columns.contains("retry_at") {
        conn.execute("ALTER TABLE deferred_tasks ADD COLUMN retry_at TEXT", [])?;
    }
    Ok(())
}
