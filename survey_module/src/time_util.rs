use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M%z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeParseError {
    #[error("datetime value is empty")]
    Empty,
    #[error("unparsable datetime: {0}")]
    Unparsable(String),
    #[error("datetime {0} does not exist in timezone {1}")]
    Nonexistent(String, String),
}

/// Converts a scheduling timestamp entered in `timezone` into a UTC instant.
///
/// Naive values are read as wall-clock time in `timezone`. Values carrying an
/// offset keep it and are re-expressed in `timezone` before normalizing.
/// Unknown timezone names fall back to UTC.
pub fn convert_to_utc(local: &str, timezone: &str) -> Result<DateTime<Utc>, TimeParseError> {
    let raw = local.trim();
    if raw.is_empty() {
        return Err(TimeParseError::Empty);
    }
    let tz = resolve_timezone(timezone);

    if let Some(aware) = parse_with_offset(raw) {
        return Ok(aware.with_timezone(&tz).with_timezone(&Utc));
    }

    let naive = parse_naive(raw).ok_or_else(|| TimeParseError::Unparsable(raw.to_string()))?;
    let localized = localize(&tz, naive)
        .ok_or_else(|| TimeParseError::Nonexistent(raw.to_string(), tz.name().to_string()))?;
    Ok(localized.with_timezone(&Utc))
}

pub fn resolve_timezone(name: &str) -> Tz {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Tz::UTC;
    }
    match trimmed.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("unknown timezone {}; falling back to UTC", trimmed);
            Tz::UTC
        }
    }
}

fn parse_with_offset(raw: &str) -> Option<DateTime<chrono::FixedOffset>> {
    if let Ok(value) = DateTime::parse_from_rfc3339(raw) {
        return Some(value);
    }
    OFFSET_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(raw, format).ok())
}

fn parse_naive(raw: &str) -> Option<NaiveDateTime> {
    if let Some(value) = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
    {
        return Some(value);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

// Ambiguous wall-clock times take the earlier instant; times inside a DST gap
// move forward by an hour.
fn localize(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}
