//! Time-range filters accepted by the history queries (`last_24h`, `[start,end]`, ...).

use crate::error::{MonitorError, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeFilterSpec {
    Relative(Duration),
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Since(DateTime<Utc>),
    Until(DateTime<Utc>),
}

impl TimeFilterSpec {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<TimeRange> {
        let range = match self {
            TimeFilterSpec::Relative(window) => TimeRange {
                start: now - *window,
                end: now,
            },
            TimeFilterSpec::Absolute { start, end } => TimeRange {
                start: *start,
                end: *end,
            },
            TimeFilterSpec::Since(start) => TimeRange {
                start: *start,
                end: now.max(*start),
            },
            TimeFilterSpec::Until(end) => TimeRange {
                start: DateTime::<Utc>::MIN_UTC,
                end: *end,
            },
        };

        if range.start > range.end {
            return Err(MonitorError::InvalidRequest(
                "time range start must be before end".to_string(),
            ));
        }
        Ok(range)
    }
}

/// Parses `last_30m`, `24h`, `last_7d`, `[start,end]`, `[start,]` or `[,end]`.
pub fn parse_time_value(raw: &str) -> Result<TimeFilterSpec> {
    let value = raw.trim().trim_matches('"').to_ascii_lowercase();

    if value.starts_with('[') && value.ends_with(']') {
        return parse_bracketed(&value);
    }

    let compact = value.replace(['_', '-', ' '], "");
    let relative = compact.strip_prefix("last").unwrap_or(&compact);
    parse_relative(relative)
        .map(TimeFilterSpec::Relative)
        .ok_or_else(|| MonitorError::InvalidRequest(format!("unsupported time token '{raw}'")))
}

fn parse_relative(value: &str) -> Option<Duration> {
    let split = value.find(|ch: char| !ch.is_ascii_digit())?;
    let (digits, unit) = value.split_at(split);
    let amount: i64 = digits.parse().ok()?;
    if amount <= 0 {
        return None;
    }

    match unit {
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::try_minutes(amount),
        "h" | "hour" | "hours" => Duration::try_hours(amount),
        "d" | "day" | "days" => Duration::try_days(amount),
        _ => None,
    }
}

fn parse_bracketed(value: &str) -> Result<TimeFilterSpec> {
    let inner = value.trim_matches(['[', ']']);
    let (start_raw, end_raw) = inner
        .split_once(',')
        .ok_or_else(|| MonitorError::InvalidRequest("invalid time range".into()))?;

    match (start_raw.trim(), end_raw.trim()) {
        ("", "") => Err(MonitorError::InvalidRequest(
            "time range requires at least one bound".into(),
        )),
        (start, "") => Ok(TimeFilterSpec::Since(parse_datetime(start)?)),
        ("", end) => Ok(TimeFilterSpec::Until(parse_datetime(end)?)),
        (start, end) => Ok(TimeFilterSpec::Absolute {
            start: parse_datetime(start)?,
            end: parse_datetime(end)?,
        }),
    }
}

pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    // rfc3339 parsing is case-sensitive on the separator and zone designator
    if let Ok(dt) = DateTime::parse_from_rfc3339(&value.to_ascii_uppercase()) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    Err(MonitorError::InvalidRequest(format!(
        "invalid time literal '{value}'"
    )))
}
