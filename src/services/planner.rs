//! Calendar helpers: UTC truncation, local-day boundaries and history slicing.
//!
//! Every boundary is re-derived from the zone's rules at the instant in
//! question, so a range that crosses a DST change still lands on local
//! midnight / 23:59:59 on both sides of it.

use crate::models::usage::TimeWindow;
use chrono::offset::LocalResult;
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Days covered by one history replay increment.
pub const HISTORY_INCREMENT_DAYS: i64 = 20;

/// Day-scale samples are shifted this far past the batch start before being
/// attributed to a local day, keeping them clear of the 00:00-02:00 window in
/// which DST transitions happen.
pub const DAY_ROLLUP_SHIFT_HOURS: i64 = 6;

/// Far enough back from a gap reading to land on the pre-transition offset.
const GAP_LOOKBACK_HOURS: i64 = 3;

pub fn truncate_to_second(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant - Duration::nanoseconds(instant.nanosecond() as i64)
}

pub fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_second(instant) - Duration::seconds(instant.second() as i64)
}

/// Top of the UTC hour. UTC has no DST, so hour rollover is unambiguous.
pub fn truncate_to_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(instant) - Duration::minutes(instant.minute() as i64)
}

/// Map a local wall-clock reading to UTC.
///
/// Ambiguous readings (fall back) take the earlier instant. Readings inside a
/// spring-forward gap use the offset in force before the gap.
fn local_to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let before = local - Duration::hours(GAP_LOOKBACK_HOURS);
            let offset = match tz.offset_from_local_datetime(&before) {
                LocalResult::Single(o) | LocalResult::Ambiguous(o, _) => o.fix(),
                LocalResult::None => tz.offset_from_utc_datetime(&before).fix(),
            };
            Utc.from_utc_datetime(&(local - Duration::seconds(offset.local_minus_utc() as i64)))
        }
    }
}

/// 23:59:59 local time on the local day containing `instant`, expressed in UTC.
pub fn local_day_end_in_utc(tz: Tz, instant: DateTime<Utc>) -> DateTime<Utc> {
    let date = instant.with_timezone(&tz).date_naive();
    local_to_utc(tz, date.and_time(NaiveTime::MIN) + Duration::seconds(86_399))
}

/// 00:00:00 local time on the local day containing `instant`, expressed in UTC.
pub fn local_midnight_in_utc(tz: Tz, instant: DateTime<Utc>) -> DateTime<Utc> {
    let date = instant.with_timezone(&tz).date_naive();
    local_to_utc(tz, date.and_time(NaiveTime::MIN))
}

/// The local day a day-scale sample belongs to, as that day's 23:59:59 in UTC.
pub fn day_rollup_timestamp(tz: Tz, batch_start: DateTime<Utc>, index: i64) -> DateTime<Utc> {
    local_day_end_in_utc(
        tz,
        batch_start + Duration::hours(DAY_ROLLUP_SHIFT_HOURS) + Duration::days(index),
    )
}

/// The `index`-th history increment after `base_start`.
///
/// Returns `None` once the increment would start at or after `now_lag`; that is
/// the end of the replay, not an empty window.
pub fn history_increment_range(
    tz: Tz,
    now_lag: DateTime<Utc>,
    base_start: DateTime<Utc>,
    index: u32,
) -> Option<TimeWindow> {
    let shifted = base_start + Duration::days(HISTORY_INCREMENT_DAYS * index as i64);
    let start = local_midnight_in_utc(tz, shifted);
    if start >= now_lag {
        return None;
    }
    let end = local_day_end_in_utc(tz, start + Duration::days(HISTORY_INCREMENT_DAYS - 1)).min(now_lag);
    Some(TimeWindow::new(start, end))
}
