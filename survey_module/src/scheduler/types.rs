use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Attempts a retryable deferred task gets before it is parked as failed.
pub const DEFERRED_TASK_MAX_ATTEMPTS: u32 = 5;
/// Delay before the first retry of a failed deferred task; doubles per attempt.
pub const DEFERRED_RETRY_BASE_DELAY: Duration = Duration::from_secs(5);
pub const DEFERRED_RETRY_MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    PublishSurvey { survey_id: Uuid },
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::PublishSurvey { .. } => "publish_survey",
        }
    }

    // Stored verbatim; two schedules for the same target compare equal.
    pub(crate) fn payload(&self) -> Result<String, SchedulerError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Fired,
    FailedPermanently,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Fired => "fired",
            TaskStatus::FailedPermanently => "failed_permanently",
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, SchedulerError> {
        match raw {
            "pending" => Ok(TaskStatus::Pending),
            "fired" => Ok(TaskStatus::Fired),
            "failed_permanently" => Ok(TaskStatus::FailedPermanently),
            other => Err(SchedulerError::Storage(format!(
                "unknown task status {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub fire_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Earliest time a failed attempt may be retried.
    pub retry_at: Option<DateTime<Utc>>,
}

impl DeferredTask {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.fire_at <= now
            && self.retry_at.map_or(true, |retry_at| retry_at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExecutionRecord {
    pub task_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error_message: Option<String>,
}

/// Failure reported by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("uuid parse error: {0}")]
    UuidParse(#[from] uuid::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(String),
}
