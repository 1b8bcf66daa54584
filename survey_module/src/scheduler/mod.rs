mod core;
mod handler;
mod store;
mod types;
mod worker;

pub use core::DeferredScheduler;
pub use handler::{SurveyTaskHandler, TaskHandler};
pub use types::{
    DeferredTask, SchedulerError, TaskError, TaskExecutionRecord, TaskKind, TaskStatus,
    DEFERRED_RETRY_BASE_DELAY, DEFERRED_RETRY_MAX_DELAY, DEFERRED_TASK_MAX_ATTEMPTS,
};
pub use worker::{start_scheduler_threads, SchedulerControl};
