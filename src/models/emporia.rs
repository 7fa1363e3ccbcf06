//! Models for the subset of the Emporia cloud API this service reads.
//!
//! Notes
//! - Field names follow the API's camelCase payloads; everything optional in the
//!   payload stays optional here.
//! - Instants use `chrono` (`DateTime<Utc>`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceGid(pub u64);

impl fmt::Display for DeviceGid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel numbers are strings: `"1"`..`"16"`, `"1,2,3"` for the mains, and the
/// synthetic `"Balance"` / `"TotalUsage"` channels.
pub const MAINS_CHANNEL: &str = "1,2,3";
pub const BALANCE_CHANNEL: &str = "Balance";
pub const TOTAL_USAGE_CHANNEL: &str = "TotalUsage";

pub fn is_synthetic_total(channel_num: &str) -> bool {
    channel_num == BALANCE_CHANNEL || channel_num == TOTAL_USAGE_CHANNEL
}

/// Address of a single channel for chart requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    pub device_gid: DeviceGid,
    pub channel_num: String,
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.device_gid, self.channel_num)
    }
}

// =====================
// Device inventory (customers/devices, locationProperties)
// =====================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerDevices {
    #[serde(default)]
    pub customer_gid: Option<u64>,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_gid: DeviceGid,
    #[serde(default)]
    pub manufacturer_device_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub location_properties: Option<LocationProperties>,
    #[serde(default)]
    pub channels: Vec<ChannelInfo>,
    /// Devices attached to this one (smart plugs, EV chargers).
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

impl DeviceInfo {
    pub fn device_name(&self) -> Option<&str> {
        self.location_properties
            .as_ref()
            .and_then(|p| p.device_name.as_deref())
            .filter(|n| !n.trim().is_empty())
    }

    /// This device followed by every nested device, depth-first.
    pub fn flatten(self) -> Vec<DeviceInfo> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(mut d) = stack.pop() {
            let nested = std::mem::take(&mut d.devices);
            out.push(d);
            stack.extend(nested.into_iter().rev());
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub device_gid: DeviceGid,
    #[serde(default)]
    pub name: Option<String>,
    pub channel_num: String,
    #[serde(default)]
    pub channel_multiplier: Option<f64>,
    #[serde(default)]
    pub channel_type_gid: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationProperties {
    #[serde(default)]
    pub device_gid: Option<DeviceGid>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

// =====================
// Usage snapshots (getDeviceListUsages)
// =====================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListUsagesResponse {
    #[serde(default)]
    pub device_list_usages: DeviceListUsages,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListUsages {
    #[serde(default)]
    pub instant: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scale: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceUsage>,
}

/// Usage tree for one device at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUsage {
    pub device_gid: DeviceGid,
    #[serde(default)]
    pub channel_usages: Vec<ChannelUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUsage {
    pub device_gid: DeviceGid,
    pub channel_num: String,
    #[serde(default)]
    pub name: Option<String>,
    /// kWh over the requested scale; null when the device did not report.
    #[serde(default)]
    pub usage: Option<f64>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub nested_devices: Vec<DeviceUsage>,
}

impl ChannelUsage {
    pub fn channel_ref(&self) -> ChannelRef {
        ChannelRef {
            device_gid: self.device_gid,
            channel_num: self.channel_num.clone(),
        }
    }
}

// =====================
// Historical series (getChartUsage)
// =====================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartUsageResponse {
    #[serde(default)]
    pub first_usage_instant: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_list: Vec<Option<f64>>,
}

/// A series of kWh samples, one per scale unit starting at `batch_start`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartUsage {
    pub samples: Vec<Option<f64>>,
    pub batch_start: DateTime<Utc>,
}
