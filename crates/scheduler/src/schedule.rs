//! Interval and cron fire-time computation.
//!
//! Cron expressions accept the classic five fields; a seconds field of `0`
//! is prepended before parsing, and six- or seven-field expressions pass
//! through unchanged.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use models::{Error, ScheduleKind};
use std::str::FromStr;

fn parse_cron(expression: &str) -> Result<Schedule, Error> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|err| Error::Validation(format!("invalid cron expression {expression:?}: {err}")))
}

pub fn validate_schedule(kind: &ScheduleKind) -> Result<(), Error> {
    match kind {
        ScheduleKind::Interval { interval_sec } => {
            if *interval_sec == 0 {
                return Err(Error::Validation("intervalSec must be at least 1".to_string()));
            }
            Ok(())
        }
        ScheduleKind::Cron { cron_expression } => parse_cron(cron_expression).map(|_| ()),
    }
}

/// The next fire strictly after `after`, or `None` for a cron schedule
/// that never fires again.
pub fn next_fire(
    kind: &ScheduleKind,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, Error> {
    match kind {
        ScheduleKind::Interval { interval_sec } => {
            if *interval_sec == 0 {
                return Err(Error::Validation("intervalSec must be at least 1".to_string()));
            }
            Ok(Some(after + Duration::seconds(*interval_sec as i64)))
        }
        ScheduleKind::Cron { cron_expression } => {
            Ok(parse_cron(cron_expression)?.after(&after).next())
        }
    }
}

/// Up to `count` future fires, computed with the same rules the
/// dispatcher uses.
pub fn preview_fires(
    kind: &ScheduleKind,
    from: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, Error> {
    match kind {
        ScheduleKind::Interval { interval_sec } => {
            if *interval_sec == 0 {
                return Err(Error::Validation("intervalSec must be at least 1".to_string()));
            }
            Ok((1..=count as i64)
                .map(|i| from + Duration::seconds(*interval_sec as i64 * i))
                .collect())
        }
        ScheduleKind::Cron { cron_expression } => {
            Ok(parse_cron(cron_expression)?.after(&from).take(count).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_interval_next_fire() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let kind = ScheduleKind::Interval { interval_sec: 300 };
        assert_eq!(
            next_fire(&kind, now).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 5, 0).unwrap())
        );
        let fires = preview_fires(&kind, now, 3).unwrap();
        assert_eq!(fires.len(), 3);
        assert_eq!(fires[2], Utc.with_ymd_and_hms(2024, 6, 1, 12, 15, 0).unwrap());
    }

    #[test]
    fn test_five_field_cron_daily() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let kind = ScheduleKind::Cron { cron_expression: "30 3 * * *".to_string() };
        assert_eq!(
            next_fire(&kind, now).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 6, 2, 3, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_six_field_cron_passes_through() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let kind = ScheduleKind::Cron { cron_expression: "0 */15 * * * *".to_string() };
        assert_eq!(
            next_fire(&kind, now).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 15, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_cron_is_validation_error() {
        let kind = ScheduleKind::Cron { cron_expression: "not a cron".to_string() };
        assert_eq!(validate_schedule(&kind).unwrap_err().code(), "VALIDATION");
        assert_eq!(next_fire(&kind, Utc::now()).unwrap_err().code(), "VALIDATION");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let kind = ScheduleKind::Interval { interval_sec: 0 };
        assert_eq!(validate_schedule(&kind).unwrap_err().code(), "VALIDATION");
    }
}
