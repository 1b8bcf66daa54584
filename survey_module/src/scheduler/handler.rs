use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::survey_store::{PublishOutcome, SurveyStore, SurveyStoreError};

use super::types::{DeferredTask, TaskError, TaskKind};

pub trait TaskHandler {
    fn handle(&self, task: &DeferredTask) -> Result<(), TaskError>;
}

impl<T: TaskHandler + ?Sized> TaskHandler for Arc<T> {
    fn handle(&self, task: &DeferredTask) -> Result<(), TaskError> {
        (**self).handle(task)
    }
}

/// Runs deferred survey work against the survey store.
#[derive(Debug, Clone)]
pub struct SurveyTaskHandler {
    store: Arc<SurveyStore>,
}

impl SurveyTaskHandler {
    pub fn new(store: Arc<SurveyStore>) -> Self {
        Self { store }
    }
}

impl TaskHandler for SurveyTaskHandler {
    fn handle(&self, task: &DeferredTask) -> Result<(), TaskError> {
        match &task.kind {
            TaskKind::PublishSurvey { survey_id } => {
                let outcome = self
                    .store
                    .publish_if_due(*survey_id, Utc::now())
                    .map_err(classify_store_error)?;
                match outcome {
                    PublishOutcome::Published => {
                        info!("task {} published survey {}", task.id, survey_id);
                    }
                    PublishOutcome::AlreadyPublished => {
                        info!(
                            "task {} skipped survey {} (already published)",
                            task.id, survey_id
                        );
                    }
                    PublishOutcome::NotScheduled => {
                        info!(
                            "task {} skipped survey {} (no scheduled time)",
                            task.id, survey_id
                        );
                    }
                    PublishOutcome::NotYetDue(scheduled_time) => {
                        info!(
                            "task {} skipped survey {} (rescheduled for {})",
                            task.id, survey_id, scheduled_time
                        );
                    }
                }
                Ok(())
            }
        }
    }
}

fn classify_store_error(err: SurveyStoreError) -> TaskError {
    match err {
        SurveyStoreError::NotFound { .. }
        | SurveyStoreError::DateTimeParse(_)
        | SurveyStoreError::UuidParse(_)
        | SurveyStoreError::Json(_) => TaskError::Permanent(err.to_string()),
        other => TaskError::Retryable(other.to_string()),
    }
}
