pub mod csv_import;
pub mod mailer;
pub mod publish;
pub mod retry_executor;
pub mod scheduler;
pub mod service;
pub mod survey_store;
pub mod time_util;

pub(crate) mod sqlite_util;

pub use publish::{decide_publish_state, PublishDecision};
pub use scheduler::{DeferredScheduler, SchedulerError, TaskKind};
pub use survey_store::{Question, Response, Survey, SurveyStore, SurveyStoreError};
pub use time_util::{convert_to_utc, TimeParseError};
