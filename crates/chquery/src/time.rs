/// Time bucketing and range filters
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::{Captures, NoExpand, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage type of the time column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DateTimeType {
    /// Second precision `DateTime`
    #[default]
    DateTime,
    /// `DateTime64(3)`
    DateTime64,
    /// Unix seconds stored as an integer
    Timestamp,
}

impl FromStr for DateTimeType {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DATETIME" => Ok(DateTimeType::DateTime),
            "DATETIME64" => Ok(DateTimeType::DateTime64),
            "TIMESTAMP" => Ok(DateTimeType::Timestamp),
            _ => Err(TimeError::UnknownDateTimeType(s.to_string())),
        }
    }
}

/// Dashboard time range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Range from unix seconds
    pub fn from_timestamps(from: i64, to: i64) -> Option<Self> {
        Some(Self {
            from: Utc.timestamp_opt(from, 0).single()?,
            to: Utc.timestamp_opt(to, 0).single()?,
        })
    }

    /// Bounds in unix seconds, snapped to the `round` grid and widened so that
    /// every bucket touching the range is included
    pub fn rounded_bounds(&self, round: u64) -> Result<(i64, i64), TimeError> {
        let from = self.from.timestamp();
        let to = self.to.timestamp();
        if round == 0 {
            return Ok((from, to));
        }
        let overflow = || TimeError::RoundOverflow(round);
        let step = i64::try_from(round).map_err(|_| overflow())?;
        let margin = step
            .checked_mul(2)
            .and_then(|m| m.checked_sub(1))
            .ok_or_else(overflow)?;
        let from = from
            .div_euclid(step)
            .checked_mul(step)
            .and_then(|f| f.checked_sub(margin))
            .ok_or_else(overflow)?;
        let to = to
            .div_euclid(step)
            .checked_mul(step)
            .and_then(|t| t.checked_add(margin))
            .ok_or_else(overflow)?;
        Ok((from, to))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimeError {
    #[error("received duration is invalid: {0}")]
    Invalid(String),

    #[error("unknown date-time type: {0}")]
    UnknownDateTimeType(String),

    #[error("rounding by {0}s overflows the time range")]
    RoundOverflow(u64),
}

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(ms|s|m|h|d|w|M|y)$").expect("duration pattern is valid"));

/// Parse `10s`, `5m`, `1h`, ... into milliseconds
fn duration_ms(text: &str) -> Result<f64, TimeError> {
    let captures = DURATION_RE
        .captures(text.trim())
        .ok_or_else(|| TimeError::Invalid(text.to_string()))?;
    let amount: f64 = captures[1]
        .parse()
        .map_err(|_| TimeError::Invalid(text.to_string()))?;
    let unit_ms = match &captures[2] {
        "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        "w" => 604_800_000.0,
        // Calendar averages: 30.436875 and 365.2425 days
        "M" => 2_629_746_000.0,
        "y" => 31_556_952_000.0,
        unit => return Err(TimeError::Invalid(unit.to_string())),
    };
    Ok(amount * unit_ms)
}

/// Largest rounding step whose two-bucket margin still fits an `i64`
const MAX_ROUND_SECONDS: u64 = (i64::MAX / 2) as u64;

/// Interval in whole seconds, multiplied by `factor` and never below one second
pub fn convert_interval(interval: &str, factor: u32) -> Result<u64, TimeError> {
    let seconds = (duration_ms(interval)? / 1_000.0).max(1.0);
    let seconds = (seconds * f64::from(factor.max(1))).ceil();
    if seconds >= i64::MAX as f64 {
        return Err(TimeError::Invalid(interval.to_string()));
    }
    Ok(seconds as u64)
}

/// Interval in milliseconds, multiplied by `factor` and never below one millisecond
pub fn convert_interval_ms(interval: &str, factor: u32) -> Result<u64, TimeError> {
    let ms = (duration_ms(interval)?.max(1.0) * f64::from(factor.max(1))).ceil();
    if ms >= i64::MAX as f64 {
        return Err(TimeError::Invalid(interval.to_string()));
    }
    Ok(ms as u64)
}

/// Rounding step in seconds: empty means none, `$step` follows the interval
pub fn parse_round(round: &str, interval: u64) -> Result<u64, TimeError> {
    let seconds = match round.trim() {
        "" => 0,
        "$step" => interval,
        text => convert_interval(text, 1)?,
    };
    if seconds > MAX_ROUND_SECONDS {
        return Err(TimeError::Invalid(round.to_string()));
    }
    Ok(seconds)
}

/// Bucket expression for `$timeSeries`, in milliseconds
pub fn time_series(date_time_type: DateTimeType) -> &'static str {
    match date_time_type {
        DateTimeType::DateTime => "(intDiv(toUInt32($dateTimeCol), $interval) * $interval) * 1000",
        DateTimeType::DateTime64 => {
            "(intDiv(toFloat64($dateTimeCol) * 1000, ($interval * 1000)) * ($interval * 1000))"
        }
        DateTimeType::Timestamp => "(intDiv($dateTimeCol, $interval) * $interval) * 1000",
    }
}

fn convert_bound(bound: &str, date_time_type: DateTimeType) -> String {
    match date_time_type {
        DateTimeType::DateTime => format!("toDateTime({bound})"),
        DateTimeType::DateTime64 => format!("toDateTime64({bound}, 3)"),
        DateTimeType::Timestamp => bound.to_string(),
    }
}

/// Range condition on an arbitrary column
pub fn time_filter_by_column(column: &str, date_time_type: DateTimeType) -> String {
    format!(
        "{column} >= {} AND {column} <= {}",
        convert_bound("$from", date_time_type),
        convert_bound("$to", date_time_type)
    )
}

/// Expression for `$timeFilter`
///
/// The `Date` column condition is included only when the target has one; it
/// lets ClickHouse prune partitions before the time column is evaluated.
pub fn time_filter(date_time_type: DateTimeType, with_date_col: bool) -> String {
    let by_time = time_filter_by_column("$dateTimeCol", date_time_type);
    if with_date_col {
        format!("$dateCol >= toDate($from) AND $dateCol <= toDate($to) AND {by_time}")
    } else {
        by_time
    }
}

static TIME_SERIES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$timeSeries\b").expect("pattern is valid"));
static TIME_FILTER_BY_COLUMN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$timeFilterByColumn\(([^)]*)\)").expect("pattern is valid"));
static TIME_FILTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$timeFilter\b").expect("pattern is valid"));
static FROM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$from\b").expect("pattern is valid"));
static TO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$to\b").expect("pattern is valid"));

/// Substitute `$timeSeries`, `$timeFilterByColumn(col)`, `$timeFilter`, `$from` and `$to`
pub fn replace_time_filters(
    query: &str,
    range: &TimeRange,
    date_time_type: DateTimeType,
    with_date_col: bool,
    round: u64,
) -> Result<String, TimeError> {
    let (from, to) = range.rounded_bounds(round)?;

    let query = TIME_SERIES_RE.replace_all(query, NoExpand(time_series(date_time_type)));
    let query = TIME_FILTER_BY_COLUMN_RE.replace_all(&query, |caps: &Captures| {
        time_filter_by_column(caps[1].trim(), date_time_type)
    });
    let filter = time_filter(date_time_type, with_date_col);
    let query = TIME_FILTER_RE.replace_all(&query, NoExpand(&filter));
    let from = from.to_string();
    let query = FROM_RE.replace_all(&query, NoExpand(&from));
    let to = to.to_string();
    let query = TO_RE.replace_all(&query, NoExpand(&to));
    Ok(query.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_interval() {
        assert_eq!(convert_interval("30s", 1).unwrap(), 30);
        assert_eq!(convert_interval("5m", 1).unwrap(), 300);
        assert_eq!(convert_interval("1h", 2).unwrap(), 7200);
        assert_eq!(convert_interval("1d", 1).unwrap(), 86_400);
        assert_eq!(convert_interval("1w", 1).unwrap(), 604_800);
        // Sub-second intervals clamp to a second
        assert_eq!(convert_interval("100ms", 1).unwrap(), 1);
        assert_eq!(convert_interval("100ms", 3).unwrap(), 3);
        // Factor 0 behaves like 1
        assert_eq!(convert_interval("10s", 0).unwrap(), 10);
        assert!(convert_interval("ten seconds", 1).is_err());
        assert!(convert_interval("", 1).is_err());
    }

    #[test]
    fn test_date_time_type_from_str() {
        assert_eq!("datetime64".parse(), Ok(DateTimeType::DateTime64));
        assert_eq!("TIMESTAMP".parse(), Ok(DateTimeType::Timestamp));
        assert!("DATE".parse::<DateTimeType>().is_err());
    }

    #[test]
    fn test_month_and_minute_differ() {
        assert_eq!(convert_interval("1m", 1).unwrap(), 60);
        assert_eq!(convert_interval("1M", 1).unwrap(), 2_629_746);
    }

    #[test]
    fn test_convert_interval_ms() {
        assert_eq!(convert_interval_ms("100ms", 1).unwrap(), 100);
        assert_eq!(convert_interval_ms("2s", 2).unwrap(), 4000);
    }

    #[test]
    fn test_parse_round() {
        assert_eq!(parse_round("", 30).unwrap(), 0);
        assert_eq!(parse_round("$step", 30).unwrap(), 30);
        assert_eq!(parse_round("1m", 30).unwrap(), 60);
        assert!(parse_round("soon", 30).is_err());
    }

    #[test]
    fn test_time_series_per_type() {
        assert!(time_series(DateTimeType::DateTime).contains("toUInt32($dateTimeCol)"));
        assert!(time_series(DateTimeType::DateTime64).contains("toFloat64($dateTimeCol) * 1000"));
        assert_eq!(
            time_series(DateTimeType::Timestamp),
            "(intDiv($dateTimeCol, $interval) * $interval) * 1000"
        );
    }

    #[test]
    fn test_time_filter() {
        assert_eq!(
            time_filter(DateTimeType::DateTime, true),
            "$dateCol >= toDate($from) AND $dateCol <= toDate($to) AND \
             $dateTimeCol >= toDateTime($from) AND $dateTimeCol <= toDateTime($to)"
        );
        assert_eq!(
            time_filter(DateTimeType::Timestamp, false),
            "$dateTimeCol >= $from AND $dateTimeCol <= $to"
        );
        assert_eq!(
            time_filter_by_column("created", DateTimeType::DateTime64),
            "created >= toDateTime64($from, 3) AND created <= toDateTime64($to, 3)"
        );
    }

    #[test]
    fn test_rounded_bounds_widen_by_two_buckets() {
        let start = 1_700_000_030;
        let range = TimeRange::from_timestamps(start, start + 3600).unwrap();
        assert_eq!(range.rounded_bounds(0).unwrap(), (start, start + 3600));
        assert_eq!(
            range.rounded_bounds(60).unwrap(),
            (1_699_999_980 - 119, 1_700_003_580 + 119)
        );
    }

    #[test]
    fn test_rounded_bounds_overflow() {
        let range = TimeRange::from_timestamps(1_700_000_000, 1_700_003_600).unwrap();
        let huge = 6_311_390_400_000_000_000;
        assert_eq!(range.rounded_bounds(huge), Err(TimeError::RoundOverflow(huge)));
        assert_eq!(
            range.rounded_bounds(u64::MAX),
            Err(TimeError::RoundOverflow(u64::MAX))
        );
    }

    #[test]
    fn test_huge_durations_are_invalid() {
        assert_eq!(
            parse_round("200000000000y", 30),
            Err(TimeError::Invalid("200000000000y".to_string()))
        );
        assert!(convert_interval("900000000000y", 1).is_err());
        assert!(convert_interval_ms("900000000y", 1).is_err());
        assert_eq!(parse_round("100y", 30).unwrap(), 3_155_695_200);
    }

    #[test]
    fn test_replace_time_filters() {
        let range = TimeRange::from_timestamps(1_700_000_000, 1_700_003_600).unwrap();
        let sql = replace_time_filters(
            "SELECT $timeSeries AS t FROM x WHERE $timeFilter AND $timeFilterByColumn(updated) AND $fromX = $to",
            &range,
            DateTimeType::Timestamp,
            false,
            0,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT (intDiv($dateTimeCol, $interval) * $interval) * 1000 AS t FROM x \
             WHERE $dateTimeCol >= 1700000000 AND $dateTimeCol <= 1700003600 \
             AND updated >= 1700000000 AND updated <= 1700003600 AND $fromX = 1700003600"
        );
    }
}
