//! In-memory stand-ins for the upstream API and the sink.

use crate::client::{ClientError, UsageSource};
use crate::db::store::{SeriesStore, StoreError};
use crate::models::emporia::{
    ChannelRef, ChannelUsage, ChartUsage, DeviceGid, DeviceInfo, DeviceUsage, LocationProperties,
};
use crate::models::usage::{Granularity, Point, SeriesKey, TimeWindow};
use crate::utils::CancelToken;
use chrono::{DateTime, Utc};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListUsage {
        instant: DateTime<Utc>,
        granularity: Granularity,
    },
    Chart {
        channel: ChannelRef,
        window: TimeWindow,
        granularity: Granularity,
    },
    ListDevices,
    Populate(DeviceGid),
}

#[derive(Default)]
struct FakeState {
    devices: Vec<(DeviceGid, String)>,
    trees: HashMap<Granularity, Vec<DeviceUsage>>,
    charts: HashMap<(ChannelRef, Granularity), VecDeque<Vec<Option<f64>>>>,
    batch_starts: HashMap<(ChannelRef, Granularity), DateTime<Utc>>,
    failing_channels: HashSet<ChannelRef>,
    fail_list_usage: bool,
    fail_inventory: bool,
    inventory_failures: u32,
    calls: Vec<Call>,
}

/// Scripted upstream. Clones share state so a test can keep a handle after
/// boxing one into an account.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Rc<RefCell<FakeState>>,
}

impl FakeSource {
    pub fn add_device(&self, gid: u64, name: &str) {
        self.state.borrow_mut().devices.push((DeviceGid(gid), name.to_string()));
    }

    /// Tree returned by `list_usage` at `granularity`.
    pub fn set_tree(&self, granularity: Granularity, tree: Vec<DeviceUsage>) {
        self.state.borrow_mut().trees.insert(granularity, tree);
    }

    /// Queue one chart response. Responses are served in order; once the queue
    /// is empty the channel returns no samples.
    pub fn push_chart(&self, gid: u64, channel: &str, granularity: Granularity, samples: Vec<Option<f64>>) {
        self.state
            .borrow_mut()
            .charts
            .entry((chart_key(gid, channel), granularity))
            .or_default()
            .push_back(samples);
    }

    /// Report `batch_start` instead of the requested window start.
    pub fn set_batch_start(&self, gid: u64, channel: &str, granularity: Granularity, at: DateTime<Utc>) {
        self.state
            .borrow_mut()
            .batch_starts
            .insert((chart_key(gid, channel), granularity), at);
    }

    pub fn fail_channel(&self, gid: u64, channel: &str) {
        self.state.borrow_mut().failing_channels.insert(chart_key(gid, channel));
    }

    pub fn fail_list_usage(&self) {
        self.state.borrow_mut().fail_list_usage = true;
    }

    pub fn fail_inventory(&self) {
        self.state.borrow_mut().fail_inventory = true;
    }

    /// Fail the next `list_devices` call only.
    pub fn fail_inventory_once(&self) {
        self.state.borrow_mut().inventory_failures += 1;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    /// Windows requested for one channel at one granularity, in call order.
    pub fn chart_windows(&self, gid: u64, channel: &str, granularity: Granularity) -> Vec<TimeWindow> {
        let wanted = chart_key(gid, channel);
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Chart {
                    channel,
                    window,
                    granularity: g,
                } if *channel == wanted && *g == granularity => Some(*window),
                _ => None,
            })
            .collect()
    }
}

fn chart_key(gid: u64, channel: &str) -> ChannelRef {
    ChannelRef {
        device_gid: DeviceGid(gid),
        channel_num: channel.to_string(),
    }
}

fn injected(what: &str) -> ClientError {
    ClientError::Http {
        status: 503,
        message: format!("injected {} failure", what),
    }
}

impl UsageSource for FakeSource {
    fn list_usage(
        &self,
        _gids: &[DeviceGid],
        instant: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<DeviceUsage>, ClientError> {
        let mut s = self.state.borrow_mut();
        s.calls.push(Call::ListUsage { instant, granularity });
        if s.fail_list_usage {
            return Err(injected("list usage"));
        }
        Ok(s.trees.get(&granularity).cloned().unwrap_or_default())
    }

    fn chart_usage(
        &self,
        channel: &ChannelRef,
        window: TimeWindow,
        granularity: Granularity,
    ) -> Result<ChartUsage, ClientError> {
        let mut s = self.state.borrow_mut();
        s.calls.push(Call::Chart {
            channel: channel.clone(),
            window,
            granularity,
        });
        if s.failing_channels.contains(channel) {
            return Err(injected("chart"));
        }
        let key = (channel.clone(), granularity);
        let samples = s.charts.get_mut(&key).and_then(VecDeque::pop_front).unwrap_or_default();
        let batch_start = s.batch_starts.get(&key).copied().unwrap_or(window.start);
        Ok(ChartUsage { samples, batch_start })
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, ClientError> {
        let mut s = self.state.borrow_mut();
        s.calls.push(Call::ListDevices);
        if s.inventory_failures > 0 {
            s.inventory_failures -= 1;
            return Err(injected("inventory"));
        }
        if s.fail_inventory {
            return Err(injected("inventory"));
        }
        Ok(s.devices
            .iter()
            .map(|(gid, _)| DeviceInfo {
                device_gid: *gid,
                ..Default::default()
            })
            .collect())
    }

    fn populate_device_properties(&self, mut device: DeviceInfo) -> Result<DeviceInfo, ClientError> {
        let mut s = self.state.borrow_mut();
        s.calls.push(Call::Populate(device.device_gid));
        let name = s
            .devices
            .iter()
            .find(|(gid, _)| *gid == device.device_gid)
            .map(|(_, name)| name.clone());
        device.location_properties = Some(LocationProperties {
            device_gid: Some(device.device_gid),
            device_name: name,
            ..Default::default()
        });
        Ok(device)
    }
}

pub fn channel(gid: u64, num: &str, usage: Option<f64>) -> ChannelUsage {
    ChannelUsage {
        device_gid: DeviceGid(gid),
        channel_num: num.to_string(),
        usage,
        ..Default::default()
    }
}

pub fn device(gid: u64, channels: Vec<ChannelUsage>) -> DeviceUsage {
    DeviceUsage {
        device_gid: DeviceGid(gid),
        channel_usages: channels,
    }
}

/// Sink that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    seeded: RefCell<HashMap<SeriesKey, DateTime<Utc>>>,
    written: RefCell<Vec<Point>>,
    writes: Cell<usize>,
    fail_reads: Cell<bool>,
    failing_keys: RefCell<HashSet<SeriesKey>>,
    fail_writes: Cell<bool>,
    cancel_after_write: RefCell<Option<CancelToken>>,
}

impl MemoryStore {
    pub fn seed(&self, key: &SeriesKey, at: DateTime<Utc>) {
        self.seeded.borrow_mut().insert(key.clone(), at);
    }

    pub fn fail_reads(&self) {
        self.fail_reads.set(true);
    }

    pub fn fail_reads_for(&self, key: &SeriesKey) {
        self.failing_keys.borrow_mut().insert(key.clone());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// Cancel `token` once a write has landed.
    pub fn cancel_after_write(&self, token: &CancelToken) {
        *self.cancel_after_write.borrow_mut() = Some(token.clone());
    }

    pub fn written(&self) -> Vec<Point> {
        self.written.borrow().clone()
    }

    /// Number of successful `write_points` calls.
    pub fn write_calls(&self) -> usize {
        self.writes.get()
    }
}

impl SeriesStore for MemoryStore {
    fn last_timestamp(&self, key: &SeriesKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        if self.fail_reads.get() || self.failing_keys.borrow().contains(key) {
            return Err(StoreError::Connection("injected read failure".to_string()));
        }
        let seeded = self.seeded.borrow().get(key).copied();
        let written = self
            .written
            .borrow()
            .iter()
            .filter(|p| {
                p.device_name == key.device_name && p.channel_name == key.channel_name && p.granularity == key.granularity
            })
            .map(|p| p.timestamp)
            .max();
        Ok(seeded.max(written))
    }

    fn write_points(&self, points: &[Point]) -> Result<usize, StoreError> {
        if self.fail_writes.get() {
            return Err(StoreError::Connection("injected write failure".to_string()));
        }
        self.written.borrow_mut().extend_from_slice(points);
        self.writes.set(self.writes.get() + 1);
        if let Some(token) = self.cancel_after_write.borrow().as_ref() {
            token.cancel();
        }
        Ok(points.len())
    }
}
