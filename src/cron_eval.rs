//! Cron expression evaluation: next fire instant given an expression and an
//! IANA timezone.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Computes the next fire instant strictly after `after_ms`, in the wall
/// clock of `timezone`. Cron expressions here schedule on wall-clock time,
/// so the reference instant is converted into the target zone before
/// evaluation and the result converted back to UTC epoch-ms.
pub fn next_after(expr: &str, timezone: &str, after_ms: i64) -> Result<i64> {
    let schedule = parse(expr)?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| Error::ScheduleInvalid(format!("unknown timezone: {timezone}")))?;

    let after_utc = DateTime::<Utc>::from_timestamp_millis(after_ms)
        .ok_or_else(|| Error::ScheduleInvalid("reference instant out of range".into()))?;
    let after_local = after_utc.with_timezone(&tz);

    let next_local = schedule
        .after(&after_local)
        .next()
        .ok_or_else(|| Error::ScheduleInvalid("cron expression has no future fire".into()))?;

    Ok(next_local.with_timezone(&Utc).timestamp_millis())
}

/// Validates a cron expression without computing a fire instant. Used by
/// job creation so a malformed expression is rejected up front instead of
/// only surfacing when the cron handle is first armed.
pub fn validate(expr: &str) -> Result<()> {
    parse(expr).map(|_| ())
}

fn parse(expr: &str) -> Result<Schedule> {
    Schedule::from_str(&with_seconds_field(expr))
        .map_err(|e| Error::ScheduleInvalid(format!("invalid cron expression: {e}")))
}

/// The `cron` crate expects a leading seconds field; jobs are authored
/// against the standard 5-field form (`min hour dom month dow`), so a
/// `"0 "` seconds field is prepended unless the caller already supplied one.
fn with_seconds_field(expr: &str) -> String {
    match expr.split_whitespace().count() {
        5 => format!("0 {expr}"),
        _ => expr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn rejects_garbage_expression() {
        assert!(validate("not a cron expr").is_err());
    }

    #[test]
    fn accepts_standard_five_field_expression() {
        assert!(validate("0 0 * * *").is_ok());
    }

    #[test]
    fn computes_next_daily_fire_in_utc() {
        let ref_instant = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_after("0 12 * * *", "UTC", ref_instant.timestamp_millis()).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(next, expected.timestamp_millis());
    }

    #[test]
    fn rejects_unknown_timezone() {
        let err = next_after("0 12 * * *", "Narnia/Cair_Paravel", 0).unwrap_err();
        assert!(matches!(err, Error::ScheduleInvalid(_)));
    }

    #[test]
    fn respects_timezone_offset() {
        // 09:00 UTC reference; next 07:00 local fire in UTC-5 is 12:00 UTC same day.
        let ref_instant = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let next = next_after("0 7 * * *", "America/New_York", ref_instant.timestamp_millis())
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        assert_eq!(next, expected.timestamp_millis());
    }
}
