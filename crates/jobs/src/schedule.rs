//! Cron schedule evaluation for repeatable jobs.
//!
//! Evaluation is a pure function of (pattern, timezone, "now") so it can be
//! tested without timers; the scheduler loop in [`crate::worker`] is the
//! only place that touches the clock.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::JobKind;

/// Default IANA timezone for cron evaluation.
pub const DEFAULT_TIMEZONE: &str = "Asia/Kolkata";

/// Schedule evaluation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
}

/// Unique schedule identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered repeatable job: one job instance is enqueued per cron tick.
///
/// Registration is deduplicated by (kind type name, pattern), so
/// re-registering on process restart is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatableSchedule {
    pub id: ScheduleId,
    pub kind: JobKind,
    pub pattern: String,
    pub timezone: String,
    pub payload: serde_json::Value,
    pub next_fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RepeatableSchedule {
    /// Deduplication key for idempotent registration.
    pub fn dedup_key(&self) -> (String, String) {
        (self.kind.type_name().to_string(), self.pattern.clone())
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

/// Next fire time strictly after `after`, evaluated in `tz`.
///
/// Returns `None` for patterns with no future occurrence.
pub fn next_fire_after(
    pattern: &str,
    tz: Tz,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_pattern(pattern)?;
    let local = after.with_timezone(&tz);
    Ok(schedule.after(&local).next().map(|dt| dt.with_timezone(&Utc)))
}

/// Validate a pattern without evaluating it.
pub fn validate_pattern(pattern: &str) -> Result<(), ScheduleError> {
    parse_pattern(pattern).map(|_| ())
}

fn parse_pattern(pattern: &str) -> Result<Schedule, ScheduleError> {
    let normalized = normalize_pattern(pattern);
    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// The `cron` crate wants a seconds field; classic five-field crontab
/// patterns get `0` prepended.
fn normalize_pattern(pattern: &str) -> String {
    let fields = pattern.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", pattern.trim())
    } else {
        pattern.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_patterns_are_normalized() {
        assert_eq!(normalize_pattern("0 8 * * *"), "0 0 8 * * *");
        assert_eq!(normalize_pattern("0 0 8 * * *"), "0 0 8 * * *");
    }

    #[test]
    fn daily_eight_am_kolkata() {
        let tz = parse_timezone(DEFAULT_TIMEZONE).unwrap();
        // 2024-03-10 12:00 UTC == 17:30 IST, so the next 08:00 IST is on the 11th.
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let next = next_fire_after("0 8 * * *", tz, after).unwrap().unwrap();

        let local = next.with_timezone(&tz);
        assert_eq!(local.format("%Y-%m-%d %H:%M").to_string(), "2024-03-11 08:00");
        // 08:00 IST == 02:30 UTC.
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 2, 30, 0).unwrap());
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let tz = parse_timezone("UTC").unwrap();
        let at_eight = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        let next = next_fire_after("0 8 * * *", tz, at_eight).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 8, 0, 0).unwrap());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let tz = parse_timezone("UTC").unwrap();
        let err = next_fire_after("not a cron", tz, Utc::now()).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidPattern { .. }));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(matches!(
            parse_timezone("Mars/Olympus_Mons"),
            Err(ScheduleError::UnknownTimezone(_))
        ));
    }
}
