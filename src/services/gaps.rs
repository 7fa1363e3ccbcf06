//! Decides which window of a series still has to be fetched.
//!
//! The policy is a pure function of the last stored timestamp and the requested
//! window; [`GapDetector`] only adds the watermark lookup.

use crate::db::store::{SeriesStore, StoreError};
use crate::models::usage::{Granularity, SeriesKey, TimeWindow};
use crate::services::planner::truncate_to_minute;
use chrono::{DateTime, Duration, Utc};
use log::debug;

/// Outcome of a gap check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub window: TimeWindow,
    /// True when the series is behind and the window has to be backfilled.
    pub fill: bool,
}

const MINUTE_STALE_AFTER_MINUTES: i64 = 2;
const MINUTE_MAX_LOOKBACK_DAYS: i64 = 7;
const MINUTE_MAX_BATCH_HOURS: i64 = 12;
const SECOND_STALE_AFTER_SECONDS: i64 = 2;
const SECOND_MAX_LOOKBACK_HOURS: i64 = 3;
const SECOND_MAX_BATCH_HOURS: i64 = 1;

/// Resolve the window to request for one series.
pub fn plan_backfill(
    granularity: Granularity,
    last: Option<DateTime<Utc>>,
    requested: TimeWindow,
    fill_in: bool,
    detailed_interval: Duration,
) -> Resolution {
    let Some(last) = last else {
        return match granularity {
            Granularity::Minute => {
                let start = requested.start - Duration::days(MINUTE_MAX_LOOKBACK_DAYS);
                Resolution {
                    window: TimeWindow::new(start, start + Duration::hours(MINUTE_MAX_BATCH_HOURS)),
                    fill: true,
                }
            }
            Granularity::Second => {
                let start = requested.start - Duration::hours(SECOND_MAX_LOOKBACK_HOURS);
                Resolution {
                    window: TimeWindow::new(start, start + Duration::hours(SECOND_MAX_BATCH_HOURS)),
                    fill: true,
                }
            }
            Granularity::Hour | Granularity::Day => Resolution {
                window: requested,
                fill: fill_in,
            },
        };
    };

    let unchanged = Resolution {
        window: requested,
        fill: fill_in,
    };

    match granularity {
        Granularity::Minute => {
            let threshold = truncate_to_minute(requested.end) - Duration::minutes(MINUTE_STALE_AFTER_MINUTES);
            if last >= threshold {
                return unchanged;
            }
            let start = (last + Duration::minutes(1)).max(requested.end - Duration::days(MINUTE_MAX_LOOKBACK_DAYS));
            let end = requested
                .end
                .min(start + Duration::hours(MINUTE_MAX_BATCH_HOURS))
                .max(start);
            Resolution {
                window: TimeWindow::new(start, end),
                fill: true,
            }
        }
        Granularity::Second => {
            if last >= requested.start - Duration::seconds(SECOND_STALE_AFTER_SECONDS) {
                return unchanged;
            }
            let mut start = last + Duration::seconds(1);
            let mut end = requested.end;
            if end - start > Duration::hours(SECOND_MAX_BATCH_HOURS) {
                if detailed_interval >= Duration::hours(SECOND_MAX_BATCH_HOURS) {
                    start = requested.end - Duration::hours(SECOND_MAX_BATCH_HOURS);
                } else {
                    start = start.max(requested.end - Duration::hours(SECOND_MAX_LOOKBACK_HOURS));
                    end = start + Duration::hours(SECOND_MAX_BATCH_HOURS);
                }
            }
            Resolution {
                window: TimeWindow::new(start, end.max(start)),
                fill: true,
            }
        }
        Granularity::Hour | Granularity::Day => unchanged,
    }
}

/// [`plan_backfill`] backed by the sink's watermark.
pub struct GapDetector<'a> {
    store: &'a dyn SeriesStore,
    detailed_interval: Duration,
}

impl<'a> GapDetector<'a> {
    pub fn new(store: &'a dyn SeriesStore, detailed_interval: Duration) -> Self {
        GapDetector {
            store,
            detailed_interval,
        }
    }

    pub fn resolve(&self, key: &SeriesKey, requested: TimeWindow, fill_in: bool) -> Result<Resolution, StoreError> {
        if matches!(key.granularity, Granularity::Hour | Granularity::Day) {
            return Ok(Resolution {
                window: requested,
                fill: fill_in,
            });
        }
        let last = self.store.last_timestamp(key)?;
        let resolution = plan_backfill(key.granularity, last, requested, fill_in, self.detailed_interval);
        if resolution.fill {
            debug!(
                "{} behind (last={}), requesting {}",
                key,
                last.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
                resolution.window
            );
        }
        Ok(resolution)
    }
}
