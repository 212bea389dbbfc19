use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod align;
pub mod cache;

pub use align::{align, alignment_offset, AxisTime};
pub use cache::{merge, CacheDelta, TimeValueCache};

/// Seconds since Unix epoch.
pub type Timestamp = i64;

/// Integers at or above this magnitude are treated as milliseconds.
const MILLIS_THRESHOLD: u64 = 100_000_000_000;
/// Magnitudes at or above this are not epoch times in either unit.
const MAX_EPOCH_MILLIS: u64 = MILLIS_THRESHOLD * 1000;

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Candle granularity of a chart context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    Seconds(u32),
    Minutes(u32),
    Hours(u32),
    Days(u32),
    Weeks(u32),
}

impl TimeFrame {
    /// Parse e.g. "30s", "1m", "15m", "4h", "1d", "1w".
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit())?;
        let (count, unit) = s.split_at(split);
        let count: u32 = count.parse().ok().filter(|n| *n > 0)?;
        match unit {
            "s" => Some(TimeFrame::Seconds(count)),
            "m" | "min" => Some(TimeFrame::Minutes(count)),
            "h" => Some(TimeFrame::Hours(count)),
            "d" | "D" => Some(TimeFrame::Days(count)),
            "w" | "W" => Some(TimeFrame::Weeks(count)),
            _ => None,
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TimeFrame::Seconds(s) => write!(f, "{s}s"),
            TimeFrame::Minutes(m) => write!(f, "{m}m"),
            TimeFrame::Hours(h) => write!(f, "{h}h"),
            TimeFrame::Days(d) => write!(f, "{d}d"),
            TimeFrame::Weeks(w) => write!(f, "{w}w"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeFrameError(pub String);

impl fmt::Display for ParseTimeFrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid timeframe: {}", self.0)
    }
}

impl std::error::Error for ParseTimeFrameError {}

impl FromStr for TimeFrame {
    type Err = ParseTimeFrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeFrame::parse(s).ok_or_else(|| ParseTimeFrameError(s.to_string()))
    }
}

/// A timestamp exactly as the server sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTime {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawTime {
    /// Resolve to seconds since epoch. Epoch zero and unparsable text are invalid.
    pub fn resolve(&self) -> Option<Timestamp> {
        let secs = match self {
            RawTime::Int(n) => normalize_millis(*n)?,
            RawTime::Float(f) => float_secs(*f)?,
            RawTime::Text(text) => parse_time_text(text)?,
        };
        (secs != 0).then_some(secs)
    }
}

impl From<Timestamp> for RawTime {
    fn from(t: Timestamp) -> Self {
        RawTime::Int(t)
    }
}

impl From<&str> for RawTime {
    fn from(s: &str) -> Self {
        RawTime::Text(s.to_string())
    }
}

fn normalize_millis(n: i64) -> Option<Timestamp> {
    match n.unsigned_abs() {
        m if m >= MAX_EPOCH_MILLIS => None,
        m if m >= MILLIS_THRESHOLD => Some(n / 1000),
        _ => Some(n),
    }
}

fn float_secs(f: f64) -> Option<Timestamp> {
    if !f.is_finite() || f.abs() >= MAX_EPOCH_MILLIS as f64 {
        return None;
    }
    normalize_millis(f.trunc() as i64)
}

fn parse_time_text(text: &str) -> Option<Timestamp> {
    let text = text.trim();
    if let Ok(n) = text.parse::<i64>() {
        return normalize_millis(n);
    }
    if let Ok(f) = text.parse::<f64>() {
        return float_secs(f);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// Serde helper accepting any `RawTime` form for a required timestamp field.
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = RawTime::deserialize(deserializer)?;
    raw.resolve()
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw:?}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(
        alias = "ts",
        alias = "timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub time: Timestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// One `(time, value)` sample of an indicator output line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub time: Timestamp,
    pub value: f64,
}

impl TimePoint {
    pub fn new(time: Timestamp, value: f64) -> Self {
        Self { time, value }
    }
}

pub trait HasTimestamp {
    fn time(&self) -> Timestamp;
}

impl HasTimestamp for Candle {
    fn time(&self) -> Timestamp {
        self.time
    }
}

impl HasTimestamp for TimePoint {
    fn time(&self) -> Timestamp {
        self.time
    }
}

/// True if `items` is strictly increasing in time.
pub fn is_strictly_ordered<T: HasTimestamp>(items: &[T]) -> bool {
    items.windows(2).all(|w| w[0].time() < w[1].time())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parses_and_formats() {
        assert_eq!(TimeFrame::parse("15m"), Some(TimeFrame::Minutes(15)));
        assert_eq!(TimeFrame::parse("4h"), Some(TimeFrame::Hours(4)));
        assert_eq!(TimeFrame::parse("1d").map(|tf| tf.to_string()), Some("1d".into()));
        assert!(TimeFrame::parse("0m").is_none());
        assert!(TimeFrame::parse("m").is_none());
        assert!("7x".parse::<TimeFrame>().is_err());
    }

    #[test]
    fn out_of_range_times_are_invalid() {
        assert_eq!(RawTime::Int(i64::MIN).resolve(), None);
        assert_eq!(RawTime::Int(i64::MAX).resolve(), None);
        assert_eq!(RawTime::Float(-1e30).resolve(), None);
        assert_eq!(RawTime::Float(1e30).resolve(), None);
        assert_eq!(RawTime::from("-1e30").resolve(), None);
        assert_eq!(RawTime::from("-9223372036854775808").resolve(), None);
        assert_eq!(RawTime::Int(-1_700_000_000_000).resolve(), Some(-1_700_000_000));

        let bad = serde_json::from_str::<Candle>(
            r#"{"time":-9223372036854775808,"open":1,"high":2,"low":0,"close":1}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn raw_time_resolves_supported_forms() {
        assert_eq!(RawTime::Int(1_700_000_000).resolve(), Some(1_700_000_000));
        assert_eq!(RawTime::Int(1_700_000_000_123).resolve(), Some(1_700_000_000));
        assert_eq!(RawTime::Float(1_700_000_000.9).resolve(), Some(1_700_000_000));
        assert_eq!(RawTime::from("1700000000").resolve(), Some(1_700_000_000));
        assert_eq!(
            RawTime::from("2023-11-14T22:13:20Z").resolve(),
            Some(1_700_000_000)
        );
        assert_eq!(
            RawTime::from("2023-11-14 22:13:20").resolve(),
            Some(1_700_000_000)
        );
        assert_eq!(RawTime::from("2023-11-14").resolve(), Some(1_699_920_000));
    }

    #[test]
    fn epoch_zero_and_garbage_are_invalid() {
        assert_eq!(RawTime::Int(0).resolve(), None);
        assert_eq!(RawTime::from("1970-01-01T00:00:00Z").resolve(), None);
        assert_eq!(RawTime::from("not a time").resolve(), None);
        assert_eq!(RawTime::Float(f64::NAN).resolve(), None);
    }

    #[test]
    fn candle_accepts_time_aliases() {
        let c: Candle =
            serde_json::from_str(r#"{"ts":"1700000000","open":1,"high":2,"low":0.5,"close":1.5}"#)
                .unwrap();
        assert_eq!(c.time, 1_700_000_000);
        assert_eq!(c.volume, 0.0);
        let bad =
            serde_json::from_str::<Candle>(r#"{"time":0,"open":1,"high":2,"low":0,"close":1}"#);
        assert!(bad.is_err());
    }
}
