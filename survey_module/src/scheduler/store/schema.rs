pub(super) const SCHEDULER_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS deferred_tasks (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    fire_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_run TEXT,
    last_error TEXT,
    retry_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_deferred_tasks_due
    ON deferred_tasks (status, fire_at);

CREATE UNIQUE INDEX IF NOT EXISTS idx_deferred_tasks_live
    ON deferred_tasks (kind, payload)
    WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS task_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES deferred_tasks(id) ON DELETE CASCADE,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_executions_task
    ON task_executions (task_id);
"#;
