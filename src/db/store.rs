//! Time-series sink: watermark lookups and idempotent point writes.

use crate::db::models::NewEnergyUsage;
use crate::models::usage::{Point, SeriesKey};
use crate::schema;
use crate::services::planner::truncate_to_second;
use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Rows per INSERT statement; six bind parameters each keeps us well under the
/// Postgres limit of 65535.
const WRITE_CHUNK: usize = 5000;

#[derive(Debug)]
pub enum StoreError {
    Connection(String),
    Query(diesel::result::Error),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Connection(s) => write!(f, "connection error: {}", s),
            StoreError::Query(e) => write!(f, "query error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Query(e) => Some(e),
            _ => None,
        }
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::Query(value)
    }
}

/// What the collector needs from the sink.
pub trait SeriesStore {
    /// Timestamp of the most recent point in the series, if any.
    fn last_timestamp(&self, key: &SeriesKey) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Upsert points; a point with the same identity replaces the stored one.
    fn write_points(&self, points: &[Point]) -> Result<usize, StoreError>;
}

/// Drop all but the last point per identity, keeping first-seen order.
///
/// A single upsert statement may not touch the same row twice.
pub fn last_write_wins(points: &[Point]) -> Vec<&Point> {
    let mut slot: HashMap<(&str, &str, &str, &str, DateTime<Utc>), usize> = HashMap::new();
    let mut out: Vec<&Point> = Vec::with_capacity(points.len());
    for p in points {
        let id = (
            p.account_name.as_str(),
            p.device_name.as_str(),
            p.channel_name.as_str(),
            p.granularity.label(),
            p.timestamp,
        );
        match slot.get(&id) {
            Some(&i) => out[i] = p,
            None => {
                slot.insert(id, out.len());
                out.push(p);
            }
        }
    }
    out
}

/// TimescaleDB-backed store.
pub struct PgStore {
    conn: RefCell<PgConnection>,
}

impl PgStore {
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let conn = PgConnection::establish(database_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(PgStore {
            conn: RefCell::new(conn),
        })
    }

    pub fn apply_migrations(&self) -> Result<(), String> {
        let mut conn = self.conn.borrow_mut();
        match conn.run_pending_migrations(MIGRATIONS) {
            Ok(applied) => {
                if applied.is_empty() {
                    info!("Database schema is up to date; no migrations were applied");
                } else {
                    let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                    info!("Applied {} database migration(s): {}", applied.len(), names);
                }
                Ok(())
            }
            Err(e) => Err(format!("Applying database migrations failed: {}", e)),
        }
    }

    /// Delete every stored usage row.
    pub fn reset(&self) -> Result<usize, StoreError> {
        use schema::energy_usage::dsl as E;
        let deleted = diesel::delete(E::energy_usage).execute(&mut *self.conn.borrow_mut())?;
        Ok(deleted)
    }
}

impl SeriesStore for PgStore {
    fn last_timestamp(&self, key: &SeriesKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        use schema::energy_usage::dsl as E;

        let last: Option<DateTime<Utc>> = E::energy_usage
            .filter(
                E::device_name
                    .eq(&key.device_name)
                    .and(E::channel_name.eq(&key.channel_name))
                    .and(E::granularity.eq(key.granularity.label())),
            )
            .select(max(E::time))
            .first(&mut *self.conn.borrow_mut())?;
        debug!("Last stored timestamp for {}: {:?}", key, last);
        Ok(last.map(truncate_to_second))
    }

    fn write_points(&self, points: &[Point]) -> Result<usize, StoreError> {
        use schema::energy_usage::dsl as E;

        if points.is_empty() {
            return Ok(0);
        }

        let rows: Vec<NewEnergyUsage> = last_write_wins(points).into_iter().map(NewEnergyUsage::from).collect();
        let mut conn = self.conn.borrow_mut();
        let mut written = 0usize;
        for chunk in rows.chunks(WRITE_CHUNK) {
            written += diesel::insert_into(E::energy_usage)
                .values(chunk)
                .on_conflict((E::account_name, E::device_name, E::channel_name, E::granularity, E::time))
                .do_update()
                .set(E::usage_watts.eq(excluded(E::usage_watts)))
                .execute(&mut *conn)?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::usage::Granularity;
    use chrono::TimeZone;

    fn point(channel: &str, watts: f64, minute: u32) -> Point {
        Point {
            account_name: "acct".into(),
            device_name: "Home".into(),
            channel_name: channel.into(),
            usage_watts: watts,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 10, 11, minute, 0).unwrap(),
            granularity: Granularity::Minute,
        }
    }

    #[test]
    fn duplicate_identity_keeps_latest_value_in_first_position() {
        let points = vec![point("A", 1.0, 0), point("B", 2.0, 0), point("A", 3.0, 0), point("A", 4.0, 1)];
        let kept = last_write_wins(&points);
        let summary: Vec<_> = kept.iter().map(|p| (p.channel_name.as_str(), p.usage_watts)).collect();
        assert_eq!(summary, vec![("A", 3.0), ("B", 2.0), ("A", 4.0)]);
    }
}
