//! Canonical in-memory records produced by extraction and consumed by the sink.
//!
//! Nothing in here knows about the wire format of either side: the Emporia
//! payloads live in `models::emporia`, the table rows in `db::models`.

use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Resolution of a usage series.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
}

impl Granularity {
    /// Label stored in the `granularity` column.
    pub fn label(self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }

    /// Scale parameter understood by the Emporia API.
    pub fn api_scale(self) -> &'static str {
        match self {
            Granularity::Second => "1S",
            Granularity::Minute => "1MIN",
            Granularity::Hour => "1H",
            Granularity::Day => "1D",
        }
    }

    /// Factor turning a kWh reading over one sample into watts.
    ///
    /// Hour and day rollups are stored as kWh * 1000 (Wh over the period), which is
    /// what existing dashboards expect.
    pub fn watts_per_kwh(self) -> f64 {
        match self {
            Granularity::Second => 3600.0 * 1000.0,
            Granularity::Minute => 60.0 * 1000.0,
            Granularity::Hour | Granularity::Day => 1000.0,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One usage sample ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub account_name: String,
    pub device_name: String,
    pub channel_name: String,
    pub usage_watts: f64,
    pub timestamp: DateTime<Utc>,
    pub granularity: Granularity,
}

/// Identifies a series for watermark lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub device_name: String,
    pub channel_name: String,
    pub granularity: Granularity,
}

impl SeriesKey {
    pub fn new(device_name: &str, channel_name: &str, granularity: Granularity) -> Self {
        SeriesKey {
            device_name: device_name.to_string(),
            channel_name: channel_name.to_string(),
            granularity,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device_name, self.channel_name, self.granularity)
    }
}

/// `[start, end)` in UTC. The upstream treats `end` as inclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start <= end, "window start {} after end {}", start, end);
        TimeWindow { start, end }
    }

    pub fn instant(at: DateTime<Utc>) -> Self {
        TimeWindow { start: at, end: at }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use chrono::SecondsFormat;
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}
