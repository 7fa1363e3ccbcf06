//! Diesel row structs for the usage hypertable.
//!
//! Important: migrations set up `energy_usage` as a TimescaleDB hypertable keyed
//! by (account, device, channel, granularity, time).

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::models::usage::Point;
use crate::schema;

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = schema::energy_usage)]
pub struct NewEnergyUsage {
    pub time: DateTime<Utc>,
    pub account_name: String,
    pub device_name: String,
    pub channel_name: String,
    pub granularity: String,
    pub usage_watts: f64,
}

impl From<&Point> for NewEnergyUsage {
    fn from(p: &Point) -> Self {
        NewEnergyUsage {
            time: p.timestamp,
            account_name: p.account_name.clone(),
            device_name: p.device_name.clone(),
            channel_name: p.channel_name.clone(),
            granularity: p.granularity.label().to_string(),
            usage_watts: p.usage_watts,
        }
    }
}
