//! Date/time storage formats.
//!
//! The engine has no date type, so each connection decides how DATE, TIME
//! and TIMESTAMP values are stored: as integer milliseconds since the Unix
//! epoch, as a fractional Julian day number, or as ISO-8601-style text.
//! Values are carried as `Value::Date` (days), `Value::Time` (microseconds
//! since midnight) and `Value::Timestamp` (microseconds since the epoch);
//! the storage precision is milliseconds.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TypeError};
use crate::value::Value;

const MILLIS_PER_DAY: i64 = 86_400_000;
const MICROS_PER_DAY: i64 = 86_400_000_000;
/// Julian day number of 1970-01-01T00:00:00Z.
const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;

/// How one kind of date/time value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateTimeFormat {
    /// Integer milliseconds since 1970-01-01T00:00:00Z
    #[default]
    UnixEpoch,
    /// Fractional Julian day number
    JulianDay,
    /// `YYYY-MM-DD`, `HH:MM:SS.SSS` or `YYYY-MM-DD HH:MM:SS.SSS`
    Text,
}

/// The three date/time value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateTimeKind {
    Date,
    Time,
    Timestamp,
}

/// Per-connection date/time storage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DateTimeConfig {
    pub date: DateTimeFormat,
    pub time: DateTimeFormat,
    pub timestamp: DateTimeFormat,
}

/// A date/time value encoded for storage.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredDateTime {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl DateTimeKind {
    /// The kind of a date/time value, `None` for any other tag.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Date(_) => Some(DateTimeKind::Date),
            Value::Time(_) => Some(DateTimeKind::Time),
            Value::Timestamp(_) => Some(DateTimeKind::Timestamp),
            _ => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            DateTimeKind::Date => "DATE",
            DateTimeKind::Time => "TIME",
            DateTimeKind::Timestamp => "TIMESTAMP",
        }
    }
}

impl DateTimeConfig {
    /// Use the same format for all three kinds.
    pub const fn uniform(format: DateTimeFormat) -> Self {
        Self {
            date: format,
            time: format,
            timestamp: format,
        }
    }

    pub const fn date(mut self, format: DateTimeFormat) -> Self {
        self.date = format;
        self
    }

    pub const fn time(mut self, format: DateTimeFormat) -> Self {
        self.time = format;
        self
    }

    pub const fn timestamp(mut self, format: DateTimeFormat) -> Self {
        self.timestamp = format;
        self
    }

    /// The storage format configured for `kind`.
    pub const fn format_for(&self, kind: DateTimeKind) -> DateTimeFormat {
        match kind {
            DateTimeKind::Date => self.date,
            DateTimeKind::Time => self.time,
            DateTimeKind::Timestamp => self.timestamp,
        }
    }

    /// Encode a date/time value with its configured format.
    ///
    /// Returns `None` when `value` is not a `Date`, `Time` or `Timestamp`.
    pub fn encode(&self, value: &Value) -> Option<StoredDateTime> {
        let kind = DateTimeKind::of(value)?;
        let millis = match *value {
            // DATE is normalized to midnight
            Value::Date(days) => i64::from(days) * MILLIS_PER_DAY,
            Value::Time(micros) => micros.rem_euclid(MICROS_PER_DAY).div_euclid(1000),
            Value::Timestamp(micros) => micros.div_euclid(1000),
            _ => return None,
        };
        Some(match self.format_for(kind) {
            DateTimeFormat::UnixEpoch => StoredDateTime::Integer(millis),
            DateTimeFormat::JulianDay => StoredDateTime::Real(millis_to_julian_day(millis)),
            DateTimeFormat::Text => StoredDateTime::Text(format_millis(kind, millis)),
        })
    }

    /// Decode a stored value into a `Value` of the given kind.
    pub fn decode(&self, kind: DateTimeKind, stored: &StoredDateTime) -> Result<Value> {
        let millis = match stored {
            StoredDateTime::Integer(ms) => *ms,
            StoredDateTime::Real(jd) => julian_day_to_millis(*jd).ok_or_else(|| {
                decode_error(kind, format!("julian day {} out of range", jd))
            })?,
            StoredDateTime::Text(s) => parse_millis(kind, s)
                .ok_or_else(|| decode_error(kind, format!("unparseable text '{}'", s)))?,
        };
        Ok(match kind {
            DateTimeKind::Date => {
                let days = millis.div_euclid(MILLIS_PER_DAY);
                Value::Date(i32::try_from(days).map_err(|_| {
                    decode_error(kind, format!("{} days out of range", days))
                })?)
            }
            DateTimeKind::Time => Value::Time(millis.rem_euclid(MILLIS_PER_DAY) * 1000),
            DateTimeKind::Timestamp => Value::Timestamp(millis.saturating_mul(1000)),
        })
    }
}

fn decode_error(kind: DateTimeKind, actual: String) -> Error {
    Error::Type(TypeError {
        expected: kind.name(),
        actual,
        column: None,
    })
}

/// Convert epoch milliseconds to a Julian day number.
pub fn millis_to_julian_day(millis: i64) -> f64 {
    millis as f64 / MILLIS_PER_DAY as f64 + UNIX_EPOCH_JULIAN_DAY
}

/// Convert a Julian day number to epoch milliseconds, rounding to the nearest millisecond.
#[allow(clippy::cast_possible_truncation)]
pub fn julian_day_to_millis(jd: f64) -> Option<i64> {
    let millis = ((jd - UNIX_EPOCH_JULIAN_DAY) * MILLIS_PER_DAY as f64).round();
    if millis.is_finite() && millis.abs() < 9.0e15 {
        Some(millis as i64)
    } else {
        None
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
pub fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(month);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Proleptic Gregorian (year, month, day) for days since 1970-01-01.
#[allow(clippy::cast_possible_truncation)]
pub fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn format_civil(days: i64) -> String {
    let (y, m, d) = civil_from_days(days);
    if y < 0 {
        format!("-{:04}-{:02}-{:02}", -y, m, d)
    } else {
        format!("{:04}-{:02}-{:02}", y, m, d)
    }
}

fn format_clock(millis_of_day: i64) -> String {
    let secs = millis_of_day / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        millis_of_day % 1000
    )
}

fn format_millis(kind: DateTimeKind, millis: i64) -> String {
    let days = millis.div_euclid(MILLIS_PER_DAY);
    let of_day = millis.rem_euclid(MILLIS_PER_DAY);
    match kind {
        DateTimeKind::Date => format_civil(days),
        DateTimeKind::Time => format_clock(of_day),
        DateTimeKind::Timestamp => format!("{} {}", format_civil(days), format_clock(of_day)),
    }
}

/// Format days since the epoch as `YYYY-MM-DD`.
pub fn format_date(days: i32) -> String {
    format_civil(i64::from(days))
}

/// Format microseconds since midnight as `HH:MM:SS.SSS`.
pub fn format_time(micros: i64) -> String {
    format_clock(micros.rem_euclid(MICROS_PER_DAY) / 1000)
}

/// Format microseconds since the epoch as `YYYY-MM-DD HH:MM:SS.SSS`.
pub fn format_timestamp(micros: i64) -> String {
    format_millis(DateTimeKind::Timestamp, micros.div_euclid(1000))
}

fn timestamp_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([+-]?\d{4,7})-(\d{2})-(\d{2})(?:[ T](\d{2}):(\d{2})(?::(\d{2})(?:\.(\d{1,9}))?)?)?(?:Z|[+-]00:?00)?$",
        )
        .map_err(|e| tracing::warn!(error = %e, "failed to compile timestamp pattern"))
        .ok()
    })
    .as_ref()
}

fn time_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{2}):(\d{2})(?::(\d{2})(?:\.(\d{1,9}))?)?$")
            .map_err(|e| tracing::warn!(error = %e, "failed to compile time pattern"))
            .ok()
    })
    .as_ref()
}

fn clock_millis(
    h: Option<regex::Match<'_>>,
    m: Option<regex::Match<'_>>,
    s: Option<regex::Match<'_>>,
    frac: Option<regex::Match<'_>>,
) -> Option<i64> {
    let field = |c: Option<regex::Match<'_>>| -> Option<i64> {
        c.map_or(Some(0), |m| m.as_str().parse().ok())
    };
    let (h, m, s) = (field(h)?, field(m)?, field(s)?);
    if h > 23 || m > 59 || s > 59 {
        return None;
    }
    // Fractional digits beyond milliseconds are truncated.
    let ms = match frac {
        Some(f) => {
            let digits: String = f.as_str().chars().chain("00".chars()).take(3).collect();
            digits.parse::<i64>().ok()?
        }
        None => 0,
    };
    Some(((h * 60 + m) * 60 + s) * 1000 + ms)
}

fn parse_millis(kind: DateTimeKind, text: &str) -> Option<i64> {
    let text = text.trim();
    if kind == DateTimeKind::Time {
        if let Some(caps) = time_regex()?.captures(text) {
            return clock_millis(caps.get(1), caps.get(2), caps.get(3), caps.get(4));
        }
    }
    let caps = timestamp_regex()?.captures(text)?;
    let year: i64 = caps.get(1)?.as_str().parse().ok()?;
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    let day: u32 = caps.get(3)?.as_str().parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let of_day = clock_millis(caps.get(4), caps.get(5), caps.get(6), caps.get(7))?;
    Some(days_from_civil(year, month, day) * MILLIS_PER_DAY + of_day)
}
