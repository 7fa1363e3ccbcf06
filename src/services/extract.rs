//! Walks a device usage tree and turns it into points.
//!
//! Each channel is handled on its own: a failed fetch or watermark lookup is
//! logged and the walk moves on to the next channel, keeping whatever was
//! already collected.

use crate::client::{ClientError, UsageSource};
use crate::db::store::{SeriesStore, StoreError};
use crate::models::emporia::{is_synthetic_total, ChannelRef, ChannelUsage, ChartUsage, DeviceUsage};
use crate::models::usage::{Granularity, Point, SeriesKey, TimeWindow};
use crate::services::catalog::Account;
use crate::services::gaps::GapDetector;
use crate::services::planner::{
    day_rollup_timestamp, local_day_end_in_utc, truncate_to_hour, truncate_to_minute, truncate_to_second,
};
use crate::utils::format_duration;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use std::fmt::{Display, Formatter};

/// What a single pass over the tree collects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Collection {
    /// Latest minute for every channel, backfilling behind series, plus
    /// second-resolution detail when due.
    Live {
        collect_details: bool,
        detailed_start: DateTime<Utc>,
    },
    /// One completed hour or day, read from the tree's own usage values.
    Rollup {
        granularity: Granularity,
        start: DateTime<Utc>,
    },
    /// Hour and day series across a historical window.
    History { window: TimeWindow },
}

#[derive(Debug, Copy, Clone)]
pub struct CollectOptions {
    pub timezone: Tz,
    pub seconds_enabled: bool,
    pub detailed_interval: Duration,
}

#[derive(Debug)]
pub enum ExtractError {
    Source(ClientError),
    Store(StoreError),
}

impl Display for ExtractError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Source(e) => write!(f, "upstream: {}", e),
            ExtractError::Store(e) => write!(f, "watermark lookup: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::Source(e) => Some(e),
            ExtractError::Store(e) => Some(e),
        }
    }
}

impl From<ClientError> for ExtractError {
    fn from(value: ClientError) -> Self {
        ExtractError::Source(value)
    }
}

impl From<StoreError> for ExtractError {
    fn from(value: StoreError) -> Self {
        ExtractError::Store(value)
    }
}

/// Names shared by every point of one channel.
struct Labels<'n> {
    account: &'n str,
    device: &'n str,
    channel: &'n str,
}

impl Labels<'_> {
    fn point(&self, usage_watts: f64, timestamp: DateTime<Utc>, granularity: Granularity) -> Point {
        Point {
            account_name: self.account.to_string(),
            device_name: self.device.to_string(),
            channel_name: self.channel.to_string(),
            usage_watts,
            timestamp,
            granularity,
        }
    }

    fn key(&self, granularity: Granularity) -> SeriesKey {
        SeriesKey::new(self.device, self.channel, granularity)
    }
}

impl Display for Labels<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} / {}", self.account, self.device, self.channel)
    }
}

/// Push one point per non-null sample; sample `i` is stamped `timestamp(i)`.
/// Points at or after `bound` are dropped. Returns the number pushed.
fn emit_samples(
    labels: &Labels<'_>,
    chart: &ChartUsage,
    granularity: Granularity,
    timestamp: impl Fn(i64) -> DateTime<Utc>,
    bound: Option<DateTime<Utc>>,
    out: &mut Vec<Point>,
) -> usize {
    let mut pushed = 0;
    for (i, sample) in chart.samples.iter().enumerate() {
        let Some(kwh) = sample else { continue };
        let ts = timestamp(i as i64);
        if bound.is_some_and(|b| ts >= b) {
            continue;
        }
        out.push(labels.point(kwh * granularity.watts_per_kwh(), ts, granularity));
        pushed += 1;
    }
    pushed
}

pub struct Extractor<'a> {
    options: CollectOptions,
    gaps: GapDetector<'a>,
}

impl<'a> Extractor<'a> {
    pub fn new(options: CollectOptions, store: &'a dyn SeriesStore) -> Self {
        Extractor {
            gaps: GapDetector::new(store, options.detailed_interval),
            options,
        }
    }

    /// Collect points for `device` and everything nested under it into `out`.
    pub fn extract(
        &self,
        account: &mut Account,
        device: &DeviceUsage,
        stop: DateTime<Utc>,
        mode: &Collection,
        out: &mut Vec<Point>,
    ) {
        let device_name = account.device_name(device.device_gid);
        for channel in &device.channel_usages {
            for nested in &channel.nested_devices {
                self.extract(account, nested, stop, mode, out);
            }

            let channel_name = account.channel_name(&device_name, &channel.channel_num);
            let labels = Labels {
                account: &account.name,
                device: &device_name,
                channel: &channel_name,
            };
            if let Err(e) = self.extract_channel(account.source(), &labels, channel, stop, mode, out) {
                warn!("{} (channel {}): skipped: {}", labels, channel.channel_ref(), e);
            }
        }
    }

    fn extract_channel(
        &self,
        source: &dyn UsageSource,
        labels: &Labels<'_>,
        channel: &ChannelUsage,
        stop: DateTime<Utc>,
        mode: &Collection,
        out: &mut Vec<Point>,
    ) -> Result<(), ExtractError> {
        let synthetic = is_synthetic_total(&channel.channel_num);
        match *mode {
            Collection::Live {
                collect_details,
                detailed_start,
            } => {
                if let Some(kwh) = channel.usage {
                    let resolution =
                        self.gaps
                            .resolve(&labels.key(Granularity::Minute), TimeWindow::instant(stop), false)?;
                    if !resolution.fill || synthetic {
                        out.push(labels.point(
                            kwh * Granularity::Minute.watts_per_kwh(),
                            truncate_to_minute(stop),
                            Granularity::Minute,
                        ));
                    } else {
                        self.backfill_minutes(source, labels, &channel.channel_ref(), resolution.window, stop, out)?;
                    }
                }
                if synthetic || !collect_details || !self.options.seconds_enabled {
                    return Ok(());
                }
                self.collect_seconds(source, labels, &channel.channel_ref(), detailed_start, stop, out)
            }
            Collection::Rollup { granularity, start } => {
                if let Some(kwh) = channel.usage {
                    let ts = match granularity {
                        Granularity::Day => local_day_end_in_utc(self.options.timezone, start),
                        _ => start,
                    };
                    out.push(labels.point(kwh * granularity.watts_per_kwh(), ts, granularity));
                }
                Ok(())
            }
            Collection::History { window } => {
                if synthetic {
                    return Ok(());
                }
                self.collect_history(source, labels, &channel.channel_ref(), window, out)
            }
        }
    }

    /// Fetch minute data for a series that fell behind.
    ///
    /// A device that was offline returns only nulls; the window then slides
    /// forward until data shows up or the stop is reached.
    fn backfill_minutes(
        &self,
        source: &dyn UsageSource,
        labels: &Labels<'_>,
        channel: &ChannelRef,
        window: TimeWindow,
        stop: DateTime<Utc>,
        out: &mut Vec<Point>,
    ) -> Result<(), ExtractError> {
        let global_stop = truncate_to_minute(stop);
        let mut window = window;
        loop {
            let chart = source.chart_usage(channel, window, Granularity::Minute)?;
            if chart.samples.iter().any(Option::is_some) {
                let base = truncate_to_minute(chart.batch_start);
                let pushed = emit_samples(
                    labels,
                    &chart,
                    Granularity::Minute,
                    |i| base + Duration::minutes(i),
                    Some(global_stop),
                    out,
                );
                info!("{}: backfilled {} minute point(s) from {}", labels, pushed, window);
                return Ok(());
            }

            if window.end >= global_stop {
                debug!("{}: no minute data up to {}; giving up", labels, global_stop);
                return Ok(());
            }
            let span = window.duration();
            let next = TimeWindow::new((window.start + span).min(global_stop), (window.end + span).min(global_stop));
            if next.duration() <= Duration::zero() {
                return Ok(());
            }
            debug!(
                "{}: no minute data in {}; sliding forward by {}",
                labels,
                window,
                format_duration(span)
            );
            window = next;
        }
    }

    fn collect_seconds(
        &self,
        source: &dyn UsageSource,
        labels: &Labels<'_>,
        channel: &ChannelRef,
        detailed_start: DateTime<Utc>,
        stop: DateTime<Utc>,
        out: &mut Vec<Point>,
    ) -> Result<(), ExtractError> {
        let requested = TimeWindow::new(detailed_start.min(stop), stop);
        let resolution = self.gaps.resolve(&labels.key(Granularity::Second), requested, false)?;
        let chart = source.chart_usage(channel, resolution.window, Granularity::Second)?;
        let base = truncate_to_second(chart.batch_start);
        let pushed = emit_samples(
            labels,
            &chart,
            Granularity::Second,
            |i| base + Duration::seconds(i),
            None,
            out,
        );
        debug!("{}: {} second point(s) in {}", labels, pushed, resolution.window);
        Ok(())
    }

    fn collect_history(
        &self,
        source: &dyn UsageSource,
        labels: &Labels<'_>,
        channel: &ChannelRef,
        window: TimeWindow,
        out: &mut Vec<Point>,
    ) -> Result<(), ExtractError> {
        let hours = source.chart_usage(channel, window, Granularity::Hour)?;
        let base = truncate_to_hour(hours.batch_start);
        let hour_points = emit_samples(
            labels,
            &hours,
            Granularity::Hour,
            |i| base + Duration::hours(i),
            None,
            out,
        );

        let days = source.chart_usage(channel, window, Granularity::Day)?;
        let tz = self.options.timezone;
        let day_points = emit_samples(
            labels,
            &days,
            Granularity::Day,
            |i| day_rollup_timestamp(tz, days.batch_start, i),
            None,
            out,
        );
        debug!(
            "{}: {} hour and {} day point(s) in {}",
            labels, hour_points, day_points, window
        );
        Ok(())
    }
}
