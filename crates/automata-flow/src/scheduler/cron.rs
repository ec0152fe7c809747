//! Next-due computation for schedules.
//!
//! Cron expressions are the 5-field form (minute hour day-of-month month
//! day-of-week); evaluation happens in the schedule's timezone and the
//! result is normalized to UTC for storage. Interval schedules simply add
//! their period.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

use crate::error::{Error, Result};
use crate::schedule::Schedule;

/// Parses a 5-field cron expression.
///
/// The underlying parser wants a seconds column, so one is prepended;
/// 6/7-field expressions pass through untouched.
///
/// # Errors
///
/// Returns [`Error::InvalidSchedule`] on malformed expressions.
pub fn parse_cron(expr: &str) -> Result<CronSchedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };

    CronSchedule::from_str(&normalized).map_err(|err| Error::InvalidSchedule {
        message: format!("invalid cron expression {expr:?}: {err}"),
    })
}

/// Validates a cron expression without evaluating it.
///
/// # Errors
///
/// Returns [`Error::InvalidSchedule`] on malformed expressions.
pub fn validate_cron(expr: &str) -> Result<()> {
    parse_cron(expr).map(|_| ())
}

/// Resolves the timezone of a schedule, falling back to UTC on bad names.
#[must_use]
pub fn schedule_timezone(schedule: &Schedule) -> Tz {
    schedule.timezone.parse().unwrap_or(Tz::UTC)
}

/// Computes the next due time for a schedule, strictly after `from`.
///
/// # Errors
///
/// Returns [`Error::InvalidSchedule`] when the cron expression is
/// malformed, produces no future occurrence, or the schedule has neither a
/// cron expression nor an interval.
pub fn next_due(schedule: &Schedule, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let tz = schedule_timezone(schedule);
    let from_tz = from.with_timezone(&tz);

    if schedule.is_cron() {
        let parsed = parse_cron(&schedule.cron_expr)?;
        return parsed
            .after(&from_tz)
            .next()
            .map(|next| next.with_timezone(&Utc))
            .ok_or_else(|| Error::InvalidSchedule {
                message: format!(
                    "cron expression {:?} has no future occurrence",
                    schedule.cron_expr
                ),
            });
    }

    if schedule.is_interval() {
        let interval = i64::try_from(schedule.interval_sec).unwrap_or(i64::MAX);
        return Ok(from + Duration::seconds(interval));
    }

    Err(Error::InvalidSchedule {
        message: "schedule has neither cron_expr nor interval_sec".to_string(),
    })
}
