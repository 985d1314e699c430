//! In-memory state store and history log
//!
//! Used by tests and single-node demos; nothing survives a restart.

use crate::common::utils::validate_name;
use crate::common::{Error, Result};
use crate::model::{Driver, DriverId, DriverState, LocationSample, Passenger, PassengerId};
use crate::store::history_log::Timeline;
use crate::store::{HistoryLog, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

#[derive(Debug, Default)]
struct Tables {
    drivers: HashMap<DriverId, Driver>,
    passengers: HashMap<PassengerId, Passenger>,
    next_driver_id: DriverId,
    next_passenger_id: PassengerId,
}

/// HashMap-backed state store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    tables: RwLock<Tables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Internal("state store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::Internal("state store lock poisoned".into()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_driver(&self, name: &str) -> Result<Driver> {
        let name = validate_name(name)?;
        let mut tables = self.write()?;
        tables.next_driver_id += 1;
        let driver = Driver {
            id: tables.next_driver_id,
            name: name.to_string(),
            state: None,
            created_at: Utc::now(),
        };
        tables.drivers.insert(driver.id, driver.clone());
        Ok(driver)
    }

    async fn create_passenger(&self, name: &str) -> Result<Passenger> {
        let name = validate_name(name)?;
        let mut tables = self.write()?;
        tables.next_passenger_id += 1;
        let passenger = Passenger {
            id: tables.next_passenger_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        tables.passengers.insert(passenger.id, passenger.clone());
        Ok(passenger)
    }

    async fn get_driver(&self, id: DriverId) -> Result<Option<Driver>> {
        Ok(self.read()?.drivers.get(&id).cloned())
    }

    async fn get_passenger(&self, id: PassengerId) -> Result<Option<Passenger>> {
        Ok(self.read()?.passengers.get(&id).cloned())
    }

    async fn set_state(&self, id: DriverId, state: DriverState) -> Result<Option<DriverState>> {
        let mut tables = self.write()?;
        let driver = tables
            .drivers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("driver {}", id)))?;
        Ok(driver.state.replace(state))
    }

    async fn list_drivers(&self) -> Result<Vec<Driver>> {
        let mut drivers: Vec<Driver> = self.read()?.drivers.values().cloned().collect();
        drivers.sort_by_key(|d| d.id);
        Ok(drivers)
    }
}

/// HashMap-backed history log
#[derive(Debug, Default)]
pub struct MemoryHistoryLog {
    timeline: Mutex<Timeline>,
}

impl MemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn timeline(&self) -> Result<std::sync::MutexGuard<'_, Timeline>> {
        self.timeline
            .lock()
            .map_err(|_| Error::Internal("history lock poisoned".into()))
    }
}

#[async_trait]
impl HistoryLog for MemoryHistoryLog {
    async fn append(&self, sample: &LocationSample) -> Result<()> {
        self.timeline()?.insert(sample.clone());
        Ok(())
    }

    async fn query(
        &self,
        driver_id: DriverId,
        since: DateTime<Utc>,
    ) -> Result<Vec<LocationSample>> {
        Ok(self.timeline()?.since(driver_id, since))
    }

    async fn latest(&self, driver_id: DriverId) -> Result<Option<LocationSample>> {
        Ok(self.timeline()?.latest(driver_id))
    }
}
