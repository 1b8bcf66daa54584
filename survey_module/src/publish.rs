use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::time_util::{convert_to_utc, TimeParseError};

/// Stored publish fields for a survey plus the deferred publish to enqueue, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishDecision {
    pub published: bool,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub enqueue: Option<DateTime<Utc>>,
}

impl PublishDecision {
    pub(crate) fn published() -> Self {
        Self {
            published: true,
            scheduled_time: None,
            enqueue: None,
        }
    }

    fn draft() -> Self {
        Self {
            published: false,
            scheduled_time: None,
            enqueue: None,
        }
    }

    fn scheduled(fire_at: DateTime<Utc>) -> Self {
        Self {
            published: false,
            scheduled_time: Some(fire_at),
            enqueue: Some(fire_at),
        }
    }
}

/// Decides the publish state of a survey on create or update.
///
/// A schedule that is already due publishes immediately instead of failing.
pub fn decide_publish_state(
    desired_published: bool,
    scheduled_time: Option<&str>,
    timezone: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PublishDecision, TimeParseError> {
    if desired_published {
        return Ok(PublishDecision::published());
    }

    let scheduled_time = scheduled_time
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let Some(raw) = scheduled_time else {
        return Ok(PublishDecision::draft());
    };

    let fire_at = convert_to_utc(raw, timezone.unwrap_or("UTC"))?;
    if fire_at > now {
        Ok(PublishDecision::scheduled(fire_at))
    } else {
        Ok(PublishDecision::published())
    }
}
