//! Collection loop: one live pass per interval, rollups on hour/day change,
//! and a one-off history replay on the first tick.

use crate::db::store::SeriesStore;
use crate::models::emporia::DeviceUsage;
use crate::models::usage::{Granularity, Point};
use crate::services::catalog::Account;
use crate::services::extract::{CollectOptions, Collection, Extractor};
use crate::services::planner::{history_increment_range, local_day_end_in_utc, truncate_to_hour, truncate_to_second};
use crate::utils::CancelToken;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, trace};

/// Pause between history increments.
pub const HISTORY_PAUSE: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub collect: CollectOptions,
    pub detailed_enabled: bool,
    pub hours_enabled: bool,
    pub days_enabled: bool,
    pub lag: Duration,
    pub update_interval: std::time::Duration,
    pub history_days: u32,
    pub history_pause: std::time::Duration,
    /// Fetch and log only.
    pub dry_run: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub points: usize,
    pub failed_accounts: usize,
}

pub struct Scheduler<'a> {
    options: ScheduleOptions,
    store: &'a dyn SeriesStore,
    cancel: CancelToken,
    prev_hour: DateTime<Utc>,
    prev_day: DateTime<Utc>,
    detailed_start: DateTime<Utc>,
    history_pending: bool,
}

impl<'a> Scheduler<'a> {
    pub fn new(options: ScheduleOptions, store: &'a dyn SeriesStore, cancel: CancelToken, now: DateTime<Utc>) -> Self {
        let tz = options.collect.timezone;
        Scheduler {
            prev_hour: truncate_to_hour(now),
            prev_day: local_day_end_in_utc(tz, now),
            detailed_start: truncate_to_second(now),
            history_pending: options.history_days > 0,
            options,
            store,
            cancel,
        }
    }

    /// Start of the next second-resolution window.
    pub fn detailed_start(&self) -> DateTime<Utc> {
        self.detailed_start
    }

    /// Tick until cancelled.
    pub fn run(&mut self, accounts: &mut [Account]) {
        info!(
            "Collecting for {} account(s) every {}s",
            accounts.len(),
            self.options.update_interval.as_secs()
        );
        while !self.cancel.is_cancelled() {
            let summary = self.tick(accounts, Utc::now());
            info!(
                "Collection cycle done: {} point(s), {} failed account(s)",
                summary.points, summary.failed_accounts
            );
            debug!("Next second-resolution window starts at {}", self.detailed_start());
            if self.cancel.wait_timeout(self.options.update_interval) {
                break;
            }
        }
        info!("Collection loop stopped");
    }

    pub fn tick(&mut self, accounts: &mut [Account], now: DateTime<Utc>) -> TickSummary {
        let tz = self.options.collect.timezone;
        let now_lag = truncate_to_second(now) - self.options.lag;
        let detailed_interval = self.options.collect.detailed_interval;
        let since_detail = now_lag - self.detailed_start;
        let collect_details =
            self.options.detailed_enabled && detailed_interval > Duration::zero() && since_detail >= detailed_interval;
        debug!(
            "Tick at {} (collect_details={}, since last detail={}s)",
            now_lag,
            collect_details,
            since_detail.num_seconds()
        );

        let cur_hour = truncate_to_hour(now);
        let cur_day = local_day_end_in_utc(tz, now);
        let history = self.history_pending;

        let mut rollups = Vec::new();
        if !history {
            if self.options.hours_enabled && cur_hour != self.prev_hour {
                rollups.push(Collection::Rollup {
                    granularity: Granularity::Hour,
                    start: self.prev_hour,
                });
            }
            if self.options.days_enabled && cur_day != self.prev_day {
                rollups.push(Collection::Rollup {
                    granularity: Granularity::Day,
                    start: self.prev_day,
                });
            }
        }

        let live = Collection::Live {
            collect_details,
            detailed_start: self.detailed_start,
        };
        let extractor = Extractor::new(self.options.collect, self.store);
        let mut summary = TickSummary::default();
        for account in accounts.iter_mut() {
            if self.cancel.is_cancelled() {
                info!("Shutdown requested; skipping remaining accounts");
                break;
            }
            let result = if history {
                self.replay_history(&extractor, account, now_lag)
            } else {
                self.collect_account(&extractor, account, now_lag, &live, &rollups)
            };
            match result {
                Ok(n) => summary.points += n,
                Err(e) => {
                    error!("[{}] Failed to record usage: {}", account.name, e);
                    summary.failed_accounts += 1;
                }
            }
        }

        if !history {
            self.prev_hour = if self.options.hours_enabled { cur_hour } else { self.prev_hour };
            self.prev_day = if self.options.days_enabled { cur_day } else { self.prev_day };
        }
        if collect_details {
            self.detailed_start = now_lag + Duration::seconds(1);
        }
        self.history_pending = false;
        summary
    }

    fn fetch_tree(
        &self,
        account: &Account,
        instant: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<DeviceUsage>, String> {
        let gids = account.device_gids();
        account
            .source()
            .list_usage(&gids, instant, granularity)
            .map_err(|e| format!("listing {} usage at {} failed: {}", granularity, instant, e))
    }

    fn collect_account(
        &self,
        extractor: &Extractor<'_>,
        account: &mut Account,
        now_lag: DateTime<Utc>,
        live: &Collection,
        rollups: &[Collection],
    ) -> Result<usize, String> {
        let mut points = Vec::new();

        match self.fetch_tree(account, now_lag, Granularity::Minute) {
            Ok(tree) => {
                for device in &tree {
                    extractor.extract(account, device, now_lag, live, &mut points);
                }
            }
            Err(e) => error!("[{}] {}", account.name, e),
        }

        for rollup in rollups {
            let Collection::Rollup { granularity, start } = *rollup else {
                continue;
            };
            match self.fetch_tree(account, start, granularity) {
                Ok(tree) => {
                    for device in &tree {
                        extractor.extract(account, device, start, rollup, &mut points);
                    }
                }
                Err(e) => error!("[{}] {}", account.name, e),
            }
        }

        self.write(&account.name, &points)
    }

    fn replay_history(
        &self,
        extractor: &Extractor<'_>,
        account: &mut Account,
        now_lag: DateTime<Utc>,
    ) -> Result<usize, String> {
        let tz = self.options.collect.timezone;
        let base = now_lag - Duration::days(self.options.history_days as i64);
        info!(
            "[{}] Loading {} day(s) of history starting {}",
            account.name, self.options.history_days, base
        );
        let tree = self.fetch_tree(account, now_lag, Granularity::Minute)?;

        let mut written = 0;
        let mut index = 0u32;
        while let Some(window) = history_increment_range(tz, now_lag, base, index) {
            let mut points = Vec::new();
            let mode = Collection::History { window };
            for device in &tree {
                extractor.extract(account, device, now_lag, &mode, &mut points);
            }
            let n = self.write(&account.name, &points)?;
            info!("[{}] History increment {} {}: {} point(s)", account.name, index, window, n);
            written += n;

            index += 1;
            if history_increment_range(tz, now_lag, base, index).is_none() {
                break;
            }
            if self.cancel.wait_timeout(self.options.history_pause) {
                info!("[{}] Aborting history replay: shutdown requested", account.name);
                break;
            }
        }
        Ok(written)
    }

    fn write(&self, account_name: &str, points: &[Point]) -> Result<usize, String> {
        if points.is_empty() {
            return Ok(0);
        }
        for p in points {
            trace!("{:?}", p);
        }
        if self.options.dry_run {
            info!("[{}] Dry run: {} point(s) not written", account_name, points.len());
            return Ok(points.len());
        }
        self.store
            .write_points(points)
            .map_err(|e| format!("writing {} point(s) failed: {}", points.len(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{channel, device, Call, FakeSource, MemoryStore};
    use chrono::TimeZone;
    use chrono_tz::Tz;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn options() -> ScheduleOptions {
        ScheduleOptions {
            collect: CollectOptions {
                timezone: Tz::UTC,
                seconds_enabled: true,
                detailed_interval: Duration::hours(1),
            },
            detailed_enabled: true,
            hours_enabled: true,
            days_enabled: true,
            lag: Duration::seconds(5),
            update_interval: std::time::Duration::from_secs(60),
            history_days: 0,
            history_pause: std::time::Duration::ZERO,
            dry_run: false,
        }
    }

    fn account(name: &str) -> (FakeSource, Account) {
        let source = FakeSource::default();
        source.add_device(100, "Panel");
        let tree = vec![device(100, vec![channel(100, "1,2,3", Some(1.0))])];
        for g in [Granularity::Minute, Granularity::Hour, Granularity::Day] {
            source.set_tree(g, tree.clone());
        }
        let mut acct = Account::new(name, Box::new(source.clone()), Vec::new());
        acct.refresh_catalog().unwrap();
        (source, acct)
    }

    fn list_calls(source: &FakeSource) -> Vec<(DateTime<Utc>, Granularity)> {
        source
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ListUsage { instant, granularity } => Some((instant, granularity)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn hour_and_day_rollups_fire_once_on_rollover() {
        let (source, acct) = account("home");
        let mut accounts = vec![acct];
        let store = MemoryStore::default();
        let mut s = Scheduler::new(options(), &store, CancelToken::new(), utc(2024, 1, 10, 23, 58, 0));

        s.tick(&mut accounts, utc(2024, 1, 10, 23, 59, 0));
        assert_eq!(list_calls(&source), vec![(utc(2024, 1, 10, 23, 58, 55), Granularity::Minute)]);

        s.tick(&mut accounts, utc(2024, 1, 11, 0, 0, 30));
        let calls = list_calls(&source);
        assert_eq!(
            calls[1..],
            [
                (utc(2024, 1, 11, 0, 0, 25), Granularity::Minute),
                (utc(2024, 1, 10, 23, 0, 0), Granularity::Hour),
                (utc(2024, 1, 10, 23, 59, 59), Granularity::Day),
            ]
        );

        let rollups: Vec<_> = store
            .written()
            .into_iter()
            .filter(|p| p.granularity != Granularity::Minute)
            .map(|p| (p.granularity, p.timestamp, p.usage_watts))
            .collect();
        assert_eq!(
            rollups,
            vec![
                (Granularity::Hour, utc(2024, 1, 10, 23, 0, 0), 1000.0),
                (Granularity::Day, utc(2024, 1, 10, 23, 59, 59), 1000.0),
            ]
        );

        s.tick(&mut accounts, utc(2024, 1, 11, 0, 1, 30));
        assert_eq!(list_calls(&source).len(), 5);
    }

    #[test]
    fn rollups_respect_enable_flags() {
        let (source, acct) = account("home");
        let mut accounts = vec![acct];
        let store = MemoryStore::default();
        let opts = ScheduleOptions {
            hours_enabled: false,
            days_enabled: false,
            ..options()
        };
        let mut s = Scheduler::new(opts, &store, CancelToken::new(), utc(2024, 1, 10, 23, 58, 0));
        s.tick(&mut accounts, utc(2024, 1, 11, 0, 0, 30));
        assert_eq!(list_calls(&source), vec![(utc(2024, 1, 11, 0, 0, 25), Granularity::Minute)]);
    }

    #[test]
    fn detail_collection_waits_for_interval_then_advances() {
        let (source, acct) = account("home");
        let mut accounts = vec![acct];
        let store = MemoryStore::default();
        let start = utc(2024, 1, 10, 10, 0, 0);
        let mut s = Scheduler::new(options(), &store, CancelToken::new(), start);
        assert_eq!(s.detailed_start(), start);

        // the lag still applies to each tick, so a full interval has not
        // passed until now_lag reaches start + 1h
        s.tick(&mut accounts, utc(2024, 1, 10, 11, 0, 0));
        assert_eq!(s.detailed_start(), start);
        assert!(source.chart_windows(100, "1,2,3", Granularity::Second).is_empty());

        s.tick(&mut accounts, utc(2024, 1, 10, 11, 0, 5));
        assert_eq!(source.chart_windows(100, "1,2,3", Granularity::Second).len(), 1);
        assert_eq!(s.detailed_start(), utc(2024, 1, 10, 11, 0, 1));
    }

    #[test]
    fn detail_disabled_never_collects_seconds() {
        let (source, acct) = account("home");
        let mut accounts = vec![acct];
        let store = MemoryStore::default();
        let opts = ScheduleOptions {
            detailed_enabled: false,
            ..options()
        };
        let start = utc(2024, 1, 10, 10, 0, 0);
        let mut s = Scheduler::new(opts, &store, CancelToken::new(), start);
        s.tick(&mut accounts, utc(2024, 1, 10, 12, 0, 0));
        assert!(source.chart_windows(100, "1,2,3", Granularity::Second).is_empty());
        assert_eq!(s.detailed_start(), start);
    }

    #[test]
    fn history_runs_once_in_increments_then_goes_live() {
        let (source, acct) = account("home");
        for _ in 0..2 {
            source.push_chart(100, "1,2,3", Granularity::Hour, vec![Some(1.0)]);
            source.push_chart(100, "1,2,3", Granularity::Day, vec![Some(2.0)]);
        }
        let mut accounts = vec![acct];
        let store = MemoryStore::default();
        let opts = ScheduleOptions {
            history_days: 25,
            ..options()
        };
        let now = utc(2024, 4, 20, 12, 0, 0);
        let mut s = Scheduler::new(opts, &store, CancelToken::new(), now);

        let first = s.tick(&mut accounts, now);
        assert_eq!(first, TickSummary { points: 4, failed_accounts: 0 });
        assert_eq!(list_calls(&source), vec![(utc(2024, 4, 20, 11, 59, 55), Granularity::Minute)]);
        assert_eq!(
            source.chart_windows(100, "1,2,3", Granularity::Hour),
            vec![
                crate::models::usage::TimeWindow::new(utc(2024, 3, 26, 0, 0, 0), utc(2024, 4, 14, 23, 59, 59)),
                crate::models::usage::TimeWindow::new(utc(2024, 4, 15, 0, 0, 0), utc(2024, 4, 20, 11, 59, 55)),
            ]
        );
        assert_eq!(store.write_calls(), 2);
        assert!(store.written().iter().all(|p| p.granularity != Granularity::Minute));

        s.tick(&mut accounts, now + Duration::minutes(1));
        assert_eq!(source.chart_windows(100, "1,2,3", Granularity::Hour).len(), 2);
        assert_eq!(list_calls(&source).len(), 2);
        assert_eq!(list_calls(&source)[1].1, Granularity::Minute);
    }

    #[test]
    fn cancellation_stops_history_between_increments() {
        let (source, acct) = account("home");
        for _ in 0..2 {
            source.push_chart(100, "1,2,3", Granularity::Hour, vec![Some(1.0)]);
            source.push_chart(100, "1,2,3", Granularity::Day, vec![Some(2.0)]);
        }
        let mut accounts = vec![acct];
        let store = MemoryStore::default();
        let cancel = CancelToken::new();
        store.cancel_after_write(&cancel);
        let opts = ScheduleOptions {
            history_days: 25,
            ..options()
        };
        let now = utc(2024, 4, 20, 12, 0, 0);
        let mut s = Scheduler::new(opts, &store, cancel.clone(), now);

        let summary = s.tick(&mut accounts, now);
        assert_eq!(summary, TickSummary { points: 2, failed_accounts: 0 });
        assert!(cancel.is_cancelled());
        assert_eq!(store.write_calls(), 1);
        assert_eq!(
            source.chart_windows(100, "1,2,3", Granularity::Hour),
            vec![crate::models::usage::TimeWindow::new(
                utc(2024, 3, 26, 0, 0, 0),
                utc(2024, 4, 14, 23, 59, 59)
            )]
        );
        assert_eq!(source.chart_windows(100, "1,2,3", Granularity::Day).len(), 1);
    }

    #[test]
    fn failing_account_does_not_block_the_next() {
        let (broken_source, broken) = account("broken");
        broken_source.fail_list_usage();
        let (_, healthy) = account("healthy");
        let mut accounts = vec![broken, healthy];
        let store = MemoryStore::default();
        let now = utc(2024, 1, 10, 12, 0, 30);
        store.seed(
            &crate::models::usage::SeriesKey::new("Panel", "Panel", Granularity::Minute),
            utc(2024, 1, 10, 11, 59, 0),
        );
        let mut s = Scheduler::new(options(), &store, CancelToken::new(), now);

        let summary = s.tick(&mut accounts, now);
        assert_eq!(summary.points, 1);
        let written = store.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].account_name, "healthy");
    }

    #[test]
    fn write_failure_is_reported_per_account() {
        let (_, a) = account("a");
        let (_, b) = account("b");
        let mut accounts = vec![a, b];
        let store = MemoryStore::default();
        store.fail_writes(true);
        let now = utc(2024, 1, 10, 12, 0, 30);
        store.seed(
            &crate::models::usage::SeriesKey::new("Panel", "Panel", Granularity::Minute),
            utc(2024, 1, 10, 11, 59, 0),
        );
        let mut s = Scheduler::new(options(), &store, CancelToken::new(), now);
        let summary = s.tick(&mut accounts, now);
        assert_eq!(summary, TickSummary { points: 0, failed_accounts: 2 });
    }

    #[test]
    fn dry_run_never_writes() {
        let (_, acct) = account("home");
        let mut accounts = vec![acct];
        let store = MemoryStore::default();
        let now = utc(2024, 1, 10, 12, 0, 30);
        store.seed(
            &crate::models::usage::SeriesKey::new("Panel", "Panel", Granularity::Minute),
            utc(2024, 1, 10, 11, 59, 0),
        );
        let opts = ScheduleOptions {
            dry_run: true,
            ..options()
        };
        let mut s = Scheduler::new(opts, &store, CancelToken::new(), now);
        assert_eq!(s.tick(&mut accounts, now).points, 1);
        assert_eq!(store.write_calls(), 0);
    }

    #[test]
    fn cancelled_token_skips_accounts_and_stops_run() {
        let (source, acct) = account("home");
        let mut accounts = vec![acct];
        let store = MemoryStore::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let now = utc(2024, 1, 10, 12, 0, 30);
        let mut s = Scheduler::new(options(), &store, cancel, now);
        assert_eq!(s.tick(&mut accounts, now), TickSummary::default());
        s.run(&mut accounts);
        assert!(source.calls().iter().all(|c| !matches!(c, Call::ListUsage { .. })));
    }
}
