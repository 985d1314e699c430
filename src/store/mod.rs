//! The three stores behind the dispatch coordinator
//!
//! - [`StateStore`]: state-of-record for drivers and passengers
//! - [`HistoryLog`]: append-only location samples per driver
//! - [`GeoIndex`]: live positions of available drivers, queried by radius
//!
//! Each is a trait so the coordinator can run against the in-memory
//! backends in tests and against the on-disk ones in production.

pub mod geo_index;
pub mod history_log;
pub mod memory;
pub mod rocks;

pub use geo_index::H3GeoIndex;
pub use history_log::{spawn_syncer, FileHistoryLog};
pub use memory::{MemoryHistoryLog, MemoryStateStore};
pub use rocks::RocksStateStore;

use crate::common::config::{HistoryBackend, StateBackend};
use crate::common::{Config, Error, Result};
use crate::model::{
    Candidate, Driver, DriverId, DriverState, GeoEntry, LocationSample, Passenger, PassengerId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Authoritative record of identities and availability
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a driver with no recorded state. Fails on an empty name.
    async fn create_driver(&self, name: &str) -> Result<Driver>;

    /// Insert a passenger. Fails on an empty name.
    async fn create_passenger(&self, name: &str) -> Result<Passenger>;

    async fn get_driver(&self, id: DriverId) -> Result<Option<Driver>>;

    async fn get_passenger(&self, id: PassengerId) -> Result<Option<Passenger>>;

    /// Atomically replace a driver's state, returning the previous one.
    /// Fails with `NotFound` for an unknown driver.
    async fn set_state(&self, id: DriverId, state: DriverState) -> Result<Option<DriverState>>;

    async fn list_drivers(&self) -> Result<Vec<Driver>>;
}

/// Append-only location history
#[async_trait]
pub trait HistoryLog: Send + Sync {
    async fn append(&self, sample: &LocationSample) -> Result<()>;

    /// Samples observed strictly after `since`, oldest first.
    async fn query(&self, driver_id: DriverId, since: DateTime<Utc>)
        -> Result<Vec<LocationSample>>;

    async fn latest(&self, driver_id: DriverId) -> Result<Option<LocationSample>>;

    /// Make every accepted sample durable. A no-op for logs that are not
    /// backed by a file.
    async fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Live spatial index, at most one entry per driver
#[async_trait]
pub trait GeoIndex: Send + Sync {
    async fn upsert(&self, driver_id: DriverId, lat: f64, lng: f64) -> Result<()>;

    /// Removing an absent driver is not an error.
    async fn remove(&self, driver_id: DriverId) -> Result<()>;

    async fn get(&self, driver_id: DriverId) -> Result<Option<GeoEntry>>;

    /// Entries within `radius_km`, nearest first, ties by driver id.
    async fn query_nearest(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    async fn driver_ids(&self) -> Result<Vec<DriverId>>;
}

/// The set of store handles the coordinator works against
#[derive(Clone)]
pub struct Stores {
    pub state: Arc<dyn StateStore>,
    pub history: Arc<dyn HistoryLog>,
    pub geo: Arc<dyn GeoIndex>,
}

impl Stores {
    /// All-in-memory stores
    pub fn in_memory(resolution: h3o::Resolution) -> Self {
        Self {
            state: Arc::new(MemoryStateStore::new()),
            history: Arc::new(MemoryHistoryLog::new()),
            geo: Arc::new(H3GeoIndex::new(resolution)),
        }
    }

    /// Open the backends selected by `config`
    pub fn open(config: &Config) -> Result<Self> {
        let resolution = h3o::Resolution::try_from(config.geo.resolution)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let state: Arc<dyn StateStore> = match (config.state.backend, &config.state.path) {
            (StateBackend::Memory, _) => Arc::new(MemoryStateStore::new()),
            (StateBackend::RocksDb, Some(path)) => Arc::new(RocksStateStore::open(path)?),
            (StateBackend::RocksDb, None) => {
                return Err(Error::InvalidConfig("state.path is required".into()))
            }
        };

        let history: Arc<dyn HistoryLog> = match (config.history.backend, &config.history.path) {
            (HistoryBackend::Memory, _) => Arc::new(MemoryHistoryLog::new()),
            (HistoryBackend::File, Some(path)) => {
                Arc::new(FileHistoryLog::open(path, config.history.sync_policy)?)
            }
            (HistoryBackend::File, None) => {
                return Err(Error::InvalidConfig("history.path is required".into()))
            }
        };

        Ok(Self {
            state,
            history,
            geo: Arc::new(H3GeoIndex::new(resolution)),
        })
    }
}
