//! Five-field cron schedules for the auto-restart feature.
//!
//! Supports `minute hour day month weekday` with wildcards, lists,
//! ranges and steps (`*/5`, `1-5`, `0,30`, `10-50/10`). Day-of-month
//! and day-of-week combine with OR when both are restricted, matching
//! traditional cron. Weekday 7 is an alias for Sunday.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc};
use thiserror::Error;

/// Minutes scanned forward for the next match (two years).
const SCAN_HORIZON_MINUTES: i64 = 2 * 366 * 24 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("cron must have 5 fields: minute hour day month weekday")]
    FieldCount,

    #[error("invalid {field} value '{raw}'")]
    InvalidValue { field: &'static str, raw: String },

    #[error("{field} value out of range: {raw}")]
    OutOfRange { field: &'static str, raw: String },

    #[error("unsupported timezone '{0}'; use \"UTC\", \"local\" or a fixed offset like \"+02:00\"")]
    UnsupportedTimezone(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    wildcard: bool,
    values: BTreeSet<u32>,
}

impl CronField {
    fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

/// A parsed five-field schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount);
        }

        let minute = parse_field(parts[0], 0, 59, "minute")?;
        let hour = parse_field(parts[1], 0, 23, "hour")?;
        let day = parse_field(parts[2], 1, 31, "day")?;
        let month = parse_field(parts[3], 1, 12, "month")?;
        let mut weekday = parse_field(parts[4], 0, 7, "weekday")?;
        // 7 is Sunday, same as 0.
        if weekday.values.remove(&7) {
            weekday.values.insert(0);
        }

        Ok(Self {
            minute,
            hour,
            day,
            month,
            weekday,
        })
    }

    /// Whether a local wall-clock time matches. Day-of-month and
    /// day-of-week OR together when both are restricted.
    fn matches(&self, dt: &DateTime<FixedOffset>) -> bool {
        if !self.minute.contains(dt.minute())
            || !self.hour.contains(dt.hour())
            || !self.month.contains(dt.month())
        {
            return false;
        }

        let day_match = self.day.contains(dt.day());
        let dow_match = self.weekday.contains(dt.weekday().num_days_from_sunday());

        match (self.day.wildcard, self.weekday.wildcard) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => day_match,
            (false, false) => day_match || dow_match,
        }
    }

    /// The next wall-clock match strictly after `after`, scanned minute
    /// by minute within the horizon.
    pub fn next_match(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let mut cursor = after
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;
        for _ in 0..SCAN_HORIZON_MINUTES {
            if self.matches(&cursor) {
                return Some(cursor);
            }
            cursor = cursor.checked_add_signed(Duration::minutes(1))?;
        }
        None
    }
}

fn parse_field(
    raw: &str,
    min: u32,
    max: u32,
    field: &'static str,
) -> Result<CronField, CronError> {
    let token = raw.trim();
    let wildcard = token == "*";
    let mut values = BTreeSet::new();

    for piece in token.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            return Err(CronError::InvalidValue {
                field,
                raw: raw.to_string(),
            });
        }
        for value in expand_piece(piece, min, max, field)? {
            values.insert(value);
        }
    }

    if values.is_empty() {
        return Err(CronError::InvalidValue {
            field,
            raw: raw.to_string(),
        });
    }
    Ok(CronField { wildcard, values })
}

fn expand_piece(
    piece: &str,
    min: u32,
    max: u32,
    field: &'static str,
) -> Result<Vec<u32>, CronError> {
    let invalid = || CronError::InvalidValue {
        field,
        raw: piece.to_string(),
    };
    let out_of_range = || CronError::OutOfRange {
        field,
        raw: piece.to_string(),
    };

    if let Some((base, step_raw)) = piece.split_once('/') {
        let step: u32 = step_raw.parse().map_err(|_| invalid())?;
        if step == 0 {
            return Err(invalid());
        }
        let (start, end) = if base == "*" {
            (min, max)
        } else if let Some((start_raw, end_raw)) = base.split_once('-') {
            parse_range(start_raw, end_raw, min, max, field)?
        } else {
            let start: u32 = base.parse().map_err(|_| invalid())?;
            if start < min || start > max {
                return Err(out_of_range());
            }
            (start, max)
        };
        return Ok((start..=end).step_by(step as usize).collect());
    }

    if piece == "*" {
        return Ok((min..=max).collect());
    }

    if let Some((start_raw, end_raw)) = piece.split_once('-') {
        let (start, end) = parse_range(start_raw, end_raw, min, max, field)?;
        return Ok((start..=end).collect());
    }

    let value: u32 = piece.parse().map_err(|_| invalid())?;
    if value < min || value > max {
        return Err(out_of_range());
    }
    Ok(vec![value])
}

fn parse_range(
    start_raw: &str,
    end_raw: &str,
    min: u32,
    max: u32,
    field: &'static str,
) -> Result<(u32, u32), CronError> {
    let raw = format!("{start_raw}-{end_raw}");
    let start: u32 = start_raw.parse().map_err(|_| CronError::InvalidValue {
        field,
        raw: raw.clone(),
    })?;
    let end: u32 = end_raw.parse().map_err(|_| CronError::InvalidValue {
        field,
        raw: raw.clone(),
    })?;
    if start > end || start < min || end > max {
        return Err(CronError::OutOfRange { field, raw });
    }
    Ok((start, end))
}

/// Timezone the schedule is evaluated in. Named IANA zones would need
/// a tz database; the recognized forms are UTC, the host's local zone,
/// and fixed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronZone {
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl CronZone {
    pub fn parse(raw: &str) -> Result<Self, CronError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("utc") {
            return Ok(CronZone::Utc);
        }
        if trimmed.eq_ignore_ascii_case("local") {
            return Ok(CronZone::Local);
        }
        if let Ok(offset) = trimmed.parse::<FixedOffset>() {
            return Ok(CronZone::Fixed(offset));
        }
        Err(CronError::UnsupportedTimezone(trimmed.to_string()))
    }

    fn at(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            CronZone::Utc => instant.fixed_offset(),
            CronZone::Local => instant.with_timezone(&chrono::Local).fixed_offset(),
            CronZone::Fixed(offset) => instant.with_timezone(offset),
        }
    }
}

/// The next firing instant strictly after `from`, in UTC.
pub fn next_fire(
    schedule: &CronSchedule,
    zone: &CronZone,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let local = zone.at(from);
    schedule
        .next_match(local)
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn parses_common_expressions() {
        assert!(CronSchedule::parse("* * * * *").is_ok());
        assert!(CronSchedule::parse("*/5 0-6 1,15 * 1-5").is_ok());
        assert!(CronSchedule::parse("30 3 * * 7").is_ok());
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(
            CronSchedule::parse("* * * *").unwrap_err(),
            CronError::FieldCount
        );
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
    }

    #[test]
    fn every_minute_fires_on_the_next_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let from = utc(2026, 3, 1, 12, 30);
        let next = next_fire(&schedule, &CronZone::Utc, from).unwrap();
        assert_eq!(next, utc(2026, 3, 1, 12, 31));
    }

    #[test]
    fn daily_schedule_rolls_to_the_next_day() {
        let schedule = CronSchedule::parse("0 3 * * *").unwrap();
        let from = utc(2026, 3, 1, 4, 0);
        let next = next_fire(&schedule, &CronZone::Utc, from).unwrap();
        assert_eq!(next, utc(2026, 3, 2, 3, 0));
    }

    #[test]
    fn weekday_seven_is_sunday() {
        let on_seven = CronSchedule::parse("0 0 * * 7").unwrap();
        let on_zero = CronSchedule::parse("0 0 * * 0").unwrap();
        let from = utc(2026, 3, 2, 0, 0); // a Monday
        assert_eq!(
            next_fire(&on_seven, &CronZone::Utc, from),
            next_fire(&on_zero, &CronZone::Utc, from)
        );
        // 2026-03-08 is the following Sunday.
        assert_eq!(
            next_fire(&on_seven, &CronZone::Utc, from).unwrap(),
            utc(2026, 3, 8, 0, 0)
        );
    }

    #[test]
    fn restricted_day_and_weekday_combine_with_or() {
        // The 15th, or any Monday.
        let schedule = CronSchedule::parse("0 0 15 * 1").unwrap();
        let from = utc(2026, 3, 3, 0, 0); // a Tuesday
        let next = next_fire(&schedule, &CronZone::Utc, from).unwrap();
        // Monday the 9th comes before the 15th.
        assert_eq!(next, utc(2026, 3, 9, 0, 0));
    }

    #[test]
    fn fixed_offset_shifts_the_wall_clock() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        let zone = CronZone::parse("+02:00").unwrap();
        let from = utc(2026, 3, 1, 6, 30); // 08:30 at +02:00
        let next = next_fire(&schedule, &zone, from).unwrap();
        // 09:00 at +02:00 is 07:00 UTC.
        assert_eq!(next, utc(2026, 3, 1, 7, 0));
    }

    #[test]
    fn timezone_parsing() {
        assert_eq!(CronZone::parse("UTC").unwrap(), CronZone::Utc);
        assert_eq!(CronZone::parse("").unwrap(), CronZone::Utc);
        assert_eq!(CronZone::parse("local").unwrap(), CronZone::Local);
        assert!(matches!(
            CronZone::parse("+05:30").unwrap(),
            CronZone::Fixed(_)
        ));
        assert!(CronZone::parse("Mars/Olympus").is_err());
    }

    #[test]
    fn steps_and_lists_expand() {
        let schedule = CronSchedule::parse("10-50/20 0 * * *").unwrap();
        let from = utc(2026, 3, 1, 0, 0);
        let first = next_fire(&schedule, &CronZone::Utc, from).unwrap();
        assert_eq!(first, utc(2026, 3, 1, 0, 10));
        let second = next_fire(&schedule, &CronZone::Utc, first).unwrap();
        assert_eq!(second, utc(2026, 3, 1, 0, 30));
        let third = next_fire(&schedule, &CronZone::Utc, second).unwrap();
        assert_eq!(third, utc(2026, 3, 1, 0, 50));
    }
}
