use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::handler::TaskHandler;
use super::store::SqliteTaskStore;
use super::types::{
    DeferredTask, SchedulerError, TaskError, TaskExecutionRecord, TaskKind, TaskStatus,
    DEFERRED_RETRY_BASE_DELAY, DEFERRED_RETRY_MAX_DELAY, DEFERRED_TASK_MAX_ATTEMPTS,
};

/// Durable one-shot task scheduler.
///
/// Tasks live in SQLite before `schedule` returns; a timer thread (see
/// `start_scheduler_threads`) or `tick` executes them once due. Delivery is
/// at-least-once, so handlers re-check state before mutating anything.
pub struct DeferredScheduler<H: TaskHandler> {
    store: SqliteTaskStore,
    handler: H,
    max_attempts: u32,
    retry_base_delay: Duration,
    claims: Mutex<HashSet<Uuid>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl<H: TaskHandler> DeferredScheduler<H> {
    pub fn load(storage_path: impl Into<PathBuf>, handler: H) -> Result<Self, SchedulerError> {
        let store = SqliteTaskStore::new(storage_path.into())?;
        let (wake_tx, wake_rx) = bounded(1);
        Ok(Self {
            store,
            handler,
            max_attempts: DEFERRED_TASK_MAX_ATTEMPTS,
            retry_base_delay: DEFERRED_RETRY_BASE_DELAY,
            claims: Mutex::new(HashSet::new()),
            wake_tx,
            wake_rx,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before the first retry of a failed task. Later retries double it,
    /// up to `DEFERRED_RETRY_MAX_DELAY`.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn schedule(&self, kind: TaskKind, fire_at: DateTime<Utc>) -> Result<Uuid, SchedulerError> {
        let upserted = self.store.upsert_pending(&kind, fire_at, Utc::now())?;
        if upserted.superseded {
            info!(
                "moved pending {} task {} to {}",
                kind.label(),
                upserted.task_id,
                fire_at
            );
        } else {
            info!(
                "scheduled {} task {} for {}",
                kind.label(),
                upserted.task_id,
                fire_at
            );
        }
        self.wake();
        Ok(upserted.task_id)
    }

    pub fn schedule_deferred_publish(
        &self,
        survey_id: Uuid,
        fire_at: DateTime<Utc>,
    ) -> Result<Uuid, SchedulerError> {
        self.schedule(TaskKind::PublishSurvey { survey_id }, fire_at)
    }

    pub fn task(&self, id: Uuid) -> Result<Option<DeferredTask>, SchedulerError> {
        self.store.load_task(id)
    }

    pub fn pending_tasks(&self) -> Result<Vec<DeferredTask>, SchedulerError> {
        self.store.pending_tasks()
    }

    pub fn executions(&self, task_id: Uuid) -> Result<Vec<TaskExecutionRecord>, SchedulerError> {
        self.store.executions(task_id)
    }

    pub fn due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeferredTask>, SchedulerError> {
        self.store.due_tasks(now, limit)
    }

    /// Fires every task that came due while the process was down.
    pub fn reconcile(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let overdue = self.store.due_tasks(now, usize::MAX)?;
        if !overdue.is_empty() {
            info!("reconciling {} overdue deferred task(s)", overdue.len());
        }
        self.run_claimed(overdue)
    }

    pub fn tick(&self) -> Result<usize, SchedulerError> {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let due = self.store.due_tasks(now, usize::MAX)?;
        self.run_claimed(due)
    }

    /// Runs one task and records the outcome. Returns the task's status after
    /// the run, which stays `Pending` when the task was moved meanwhile or has
    /// retries left.
    pub fn execute_task(&self, task: &DeferredTask) -> Result<TaskStatus, SchedulerError> {
        let started_at = Utc::now();
        let execution_id = self.store.record_execution_start(task.id, started_at)?;
        let result = self.handler.handle(task);
        let finished_at = Utc::now();

        match result {
            Ok(()) => {
                self.store
                    .record_execution_finish(execution_id, finished_at, "success", None)?;
                if self.store.mark_fired(task.id, task.fire_at, finished_at)? {
                    Ok(TaskStatus::Fired)
                } else {
                    info!(
                        "{} task {} was rescheduled while running; leaving it pending",
                        task.kind.label(),
                        task.id
                    );
                    Ok(TaskStatus::Pending)
                }
            }
            Err(err) => {
                let message = err.to_string();
                self.store.record_execution_finish(
                    execution_id,
                    finished_at,
                    "failed",
                    Some(&message),
                )?;
                let permanent = matches!(err, TaskError::Permanent(_));
                let attempt = task.attempt_count + 1;
                let retry_at = finished_at + retry_delay(self.retry_base_delay, attempt);
                let status = self.store.record_failure(
                    task.id,
                    task.fire_at,
                    finished_at,
                    &message,
                    permanent,
                    self.max_attempts,
                    retry_at,
                )?;
                match status {
                    Some(TaskStatus::FailedPermanently) => {
                        error!(
                            "{} task {} failed permanently on attempt {}: {}",
                            task.kind.label(),
                            task.id,
                            attempt,
                            message
                        );
                        Ok(TaskStatus::FailedPermanently)
                    }
                    Some(status) => {
                        warn!(
                            "{} task {} failed on attempt {}/{}, retrying at {}: {}",
                            task.kind.label(),
                            task.id,
                            attempt,
                            self.max_attempts,
                            retry_at,
                            message
                        );
                        Ok(status)
                    }
                    None => Ok(TaskStatus::Pending),
                }
            }
        }
    }

    pub fn try_claim(&self, task_id: Uuid) -> bool {
        let mut claims = self
            .claims
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        claims.insert(task_id)
    }

    pub fn release_claim(&self, task_id: Uuid) {
        let mut claims = self
            .claims
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        claims.remove(&task_id);
    }

    /// Interrupts a pending `wait_for_wakeup`.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub fn wait_for_wakeup(&self, timeout: Duration) {
        let _ = self.wake_rx.recv_timeout(timeout);
    }

    /// How long the timer may sleep: until the earliest future task or retry,
    /// capped by `poll_interval`. Tasks already runnable but still pending (in
    /// flight or deferred for capacity) wait a full interval.
    pub fn next_wakeup(&self, now: DateTime<Utc>, poll_interval: Duration) -> Duration {
        match self.store.next_future_ready_at(now) {
            Ok(Some(ready_at)) => (ready_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(poll_interval),
            Ok(None) => poll_interval,
            Err(err) => {
                warn!("failed to read next deferred fire time: {}", err);
                poll_interval
            }
        }
    }

    fn run_claimed(&self, tasks: Vec<DeferredTask>) -> Result<usize, SchedulerError> {
        let mut executed = 0usize;
        for task in tasks {
            if !self.try_claim(task.id) {
                continue;
            }
            let result = self.execute_task(&task);
            self.release_claim(task.id);
            result?;
            executed += 1;
        }
        Ok(executed)
    }
}

/// Exponential backoff for the given (1-based) failed attempt.
pub(crate) fn retry_delay(base: Duration, attempt: u32) -> chrono::Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    let delay = base
        .checked_mul(factor)
        .unwrap_or(DEFERRED_RETRY_MAX_DELAY)
        .min(DEFERRED_RETRY_MAX_DELAY);
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300))
}
