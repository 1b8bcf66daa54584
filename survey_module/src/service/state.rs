use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::mailer::{EmailDispatcher, NotificationSender};
use crate::retry_executor::RetryExecutor;
use crate::scheduler::{DeferredScheduler, SurveyTaskHandler, TaskKind};
use crate::survey_store::SurveyStore;

use super::config::ServiceConfig;
use super::BoxError;

pub type SurveyScheduler = DeferredScheduler<SurveyTaskHandler>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub surveys: Arc<SurveyStore>,
    pub scheduler: Arc<SurveyScheduler>,
    /// `None` when no mail transport is configured.
    pub emails: Option<EmailDispatcher>,
}

impl AppState {
    pub fn new(
        config: Arc<ServiceConfig>,
        sender: Option<Arc<dyn NotificationSender>>,
    ) -> Result<Self, BoxError> {
        let surveys = Arc::new(SurveyStore::new(&config.survey_db_path)?);
        let scheduler = Arc::new(
            DeferredScheduler::load(
                &config.scheduler_state_path,
                SurveyTaskHandler::new(surveys.clone()),
            )?
            .with_retry_base_delay(config.scheduler_retry_base_delay),
        );
        let emails = sender.map(|sender| {
            EmailDispatcher::new(RetryExecutor::new(config.email_retry), sender)
        });
        Ok(Self {
            config,
            surveys,
            scheduler,
            emails,
        })
    }

    /// Startup recovery: re-enqueues orphaned publishes, then fires everything
    /// already due.
    pub fn reconcile(&self) -> Result<usize, BoxError> {
        self.requeue_orphaned_publishes()?;
        let fired = self.scheduler.reconcile(Utc::now())?;
        if fired > 0 {
            info!("startup reconciliation ran {} overdue task(s)", fired);
        }
        Ok(fired)
    }

    /// Enqueues a publish for every scheduled, unpublished survey that has no
    /// pending task: the enqueue failed after the survey was stored, or the
    /// task ran out of attempts. Returns how many were enqueued.
    pub fn requeue_orphaned_publishes(&self) -> Result<usize, BoxError> {
        let pending = self
            .scheduler
            .pending_tasks()?
            .into_iter()
            .map(|task| task.kind)
            .collect::<Vec<_>>();
        let mut requeued = 0usize;
        for (survey_id, scheduled_time) in self.surveys.scheduled_surveys()? {
            let kind = TaskKind::PublishSurvey { survey_id };
            if !pending.contains(&kind) {
                warn!(
                    "survey {} was scheduled without a pending task; re-enqueueing",
                    survey_id
                );
                self.scheduler
                    .schedule_deferred_publish(survey_id, scheduled_time)?;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}
