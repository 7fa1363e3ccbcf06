//! Per-account state: the upstream handle, device names and channel naming.

use crate::client::{ClientError, UsageSource};
use crate::config::DeviceNames;
use crate::models::emporia::{DeviceGid, MAINS_CHANNEL};
use log::{info, warn};
use std::collections::{HashMap, HashSet};

/// Device gid to display name, rebuilt from the upstream inventory.
#[derive(Debug, Default)]
pub struct NameCatalog {
    names: HashMap<DeviceGid, String>,
    gids: Vec<DeviceGid>,
    /// Gids still unknown after a refresh; they are not refreshed again until
    /// the next explicit refresh.
    unresolved: HashSet<DeviceGid>,
}

impl NameCatalog {
    pub fn get(&self, gid: DeviceGid) -> Option<&str> {
        self.names.get(&gid).map(String::as_str)
    }

    fn len(&self) -> usize {
        self.gids.len()
    }
}

pub struct Account {
    pub name: String,
    source: Box<dyn UsageSource>,
    catalog: NameCatalog,
    device_names: Vec<DeviceNames>,
}

impl Account {
    pub fn new(name: impl Into<String>, source: Box<dyn UsageSource>, device_names: Vec<DeviceNames>) -> Self {
        Account {
            name: name.into(),
            source,
            catalog: NameCatalog::default(),
            device_names,
        }
    }

    pub fn source(&self) -> &dyn UsageSource {
        self.source.as_ref()
    }

    /// Every known device gid, nested devices included.
    pub fn device_gids(&self) -> Vec<DeviceGid> {
        self.catalog.gids.clone()
    }

    /// Reload the device inventory and names from the upstream.
    pub fn refresh_catalog(&mut self) -> Result<usize, ClientError> {
        let devices = self.source.list_devices()?;
        let mut catalog = NameCatalog::default();
        for device in devices {
            let device = self.source.populate_device_properties(device)?;
            let gid = device.device_gid;
            if !catalog.gids.contains(&gid) {
                catalog.gids.push(gid);
            }
            match device.device_name() {
                Some(name) => {
                    let channels = device
                        .channels
                        .iter()
                        .map(|c| c.channel_num.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    info!(
                        "[{}] Discovered device {} ({}) with channels: {}",
                        self.name,
                        gid,
                        name,
                        if channels.is_empty() { "-" } else { channels.as_str() }
                    );
                    catalog.names.insert(gid, name.to_string());
                }
                None => warn!("[{}] Device {} has no name; its gid will be used", self.name, gid),
            }
        }
        self.catalog = catalog;
        Ok(self.catalog.len())
    }

    /// Display name of a device. An unknown gid triggers a catalog refresh;
    /// if it is still unknown after a successful refresh the gid itself is
    /// used from then on. A failed refresh is retried on the next lookup.
    pub fn device_name(&mut self, gid: DeviceGid) -> String {
        if let Some(name) = self.catalog.get(gid) {
            return name.to_string();
        }
        if !self.catalog.unresolved.contains(&gid) {
            info!("[{}] Unknown device {}; refreshing device list", self.name, gid);
            match self.refresh_catalog() {
                Ok(_) => {
                    if let Some(name) = self.catalog.get(gid) {
                        return name.to_string();
                    }
                    self.catalog.unresolved.insert(gid);
                }
                Err(e) => warn!("[{}] Refreshing device list failed: {}", self.name, e),
            }
        }
        gid.to_string()
    }

    /// Display name of a channel.
    ///
    /// Numbered channels take a configured override for the device when one
    /// exists, the mains channel is named after the device, and everything
    /// else is `<device>-<channel>`.
    pub fn channel_name(&self, device_name: &str, channel_num: &str) -> String {
        let fallback = format!("{}-{}", device_name, channel_num);
        match channel_num.parse::<u32>() {
            Ok(n) => self
                .device_names
                .iter()
                .find(|d| d.name == device_name)
                .and_then(|d| d.channels.lookup(n))
                .map(str::to_string)
                .unwrap_or(fallback),
            Err(_) if channel_num == MAINS_CHANNEL => device_name.to_string(),
            Err(_) => fallback,
        }
    }
}
