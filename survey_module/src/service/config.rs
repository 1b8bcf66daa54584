use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use send_emails_module::PostmarkConfig;
use tracing::warn;

use crate::retry_executor::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::scheduler::DEFERRED_RETRY_BASE_DELAY;

use super::BoxError;

pub const DEFAULT_INBOUND_BODY_MAX_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:5173";
pub const DEFAULT_SCHEDULER_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub runtime_root: PathBuf,
    pub survey_db_path: PathBuf,
    pub scheduler_state_path: PathBuf,
    pub scheduler_poll_interval: Duration,
    pub scheduler_max_concurrency: usize,
    /// Delay before the first retry of a failed deferred task.
    pub scheduler_retry_base_delay: Duration,
    /// How often scheduled surveys without a live publish task are re-enqueued.
    pub scheduler_reconcile_interval: Duration,
    pub email_retry: RetryPolicy,
    /// Base URL of the respondent-facing app, used in invitation links.
    pub public_base_url: String,
    pub inbound_body_max_bytes: usize,
    /// `None` unless both `POSTMARK_SERVER_TOKEN` and `POSTMARK_FROM` are set;
    /// sharing is then refused.
    pub postmark: Option<PostmarkConfig>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("SURVEY_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SURVEY_SERVICE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(5000);

        let runtime_root = resolve_path(
            env::var("SURVEY_RUNTIME_ROOT").unwrap_or_else(|_| ".survey_service".to_string()),
        )?;
        let state_root = runtime_root.join("state");
        let survey_db_path = match env::var("SURVEY_DB_PATH") {
            Ok(value) => resolve_path(value)?,
            Err(_) => state_root.join("survey.db"),
        };
        let scheduler_state_path = match env::var("SCHEDULER_STATE_PATH") {
            Ok(value) => resolve_path(value)?,
            Err(_) => state_root.join("tasks.db"),
        };

        let scheduler_poll_interval = env::var("SCHEDULER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(1));
        let scheduler_max_concurrency = env::var("SCHEDULER_MAX_CONCURRENCY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(4);
        let scheduler_retry_base_delay = env::var("SCHEDULER_RETRY_BASE_DELAY_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFERRED_RETRY_BASE_DELAY);
        let scheduler_reconcile_interval = env::var("SCHEDULER_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SCHEDULER_RECONCILE_INTERVAL);

        let max_attempts = env::var("EMAIL_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let base_delay = env::var("EMAIL_RETRY_BASE_DELAY_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_BASE_DELAY);

        let public_base_url = env::var("SURVEY_PUBLIC_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());
        let inbound_body_max_bytes = env::var("INBOUND_BODY_MAX_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_INBOUND_BODY_MAX_BYTES);

        let postmark = match PostmarkConfig::from_env() {
            Ok(postmark) => Some(postmark),
            Err(err) => {
                warn!("{}; survey sharing is disabled", err);
                None
            }
        };

        Ok(Self {
            host,
            port,
            runtime_root,
            survey_db_path,
            scheduler_state_path,
            scheduler_poll_interval,
            scheduler_max_concurrency,
            scheduler_retry_base_delay,
            scheduler_reconcile_interval,
            email_retry: RetryPolicy {
                max_attempts,
                base_delay,
            },
            public_base_url,
            inbound_body_max_bytes,
            postmark,
        })
    }
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}
