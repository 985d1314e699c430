//! State-of-record store using RocksDB
//!
//! Stores:
//! - Drivers (id → name, state, created_at)
//! - Passengers (id → name, created_at)
//! - Id sequences

use crate::common::utils::validate_name;
use crate::common::{Error, Result};
use crate::model::{Driver, DriverId, DriverState, Passenger, PassengerId};
use crate::store::StateStore;
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, IteratorMode, Options, DB};
use std::path::Path;
use std::sync::Mutex;

const CF_DRIVERS: &str = "drivers";
const CF_PASSENGERS: &str = "passengers";
const CF_META: &str = "meta";

const SEQ_DRIVER: &str = "seq:driver";
const SEQ_PASSENGER: &str = "seq:passenger";

/// RocksDB-backed state store
pub struct RocksStateStore {
    db: DB,
    /// Serializes read-modify-write sequences (id allocation, state updates)
    write_lock: Mutex<()>,
}

impl RocksStateStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path.as_ref(), vec![CF_DRIVERS, CF_PASSENGERS, CF_META])?;
        tracing::info!("Opened state store at {}", path.as_ref().display());

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Corrupted(format!("missing column family {}", name)))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Internal("state store lock poisoned".into()))
    }

    /// Allocate the next id from a sequence. Caller holds the write lock.
    fn next_id(&self, sequence: &str) -> Result<i64> {
        let cf = self.cf(CF_META)?;
        let current = match self.db.get_cf(cf, sequence.as_bytes())? {
            Some(bytes) => i64::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Corrupted(format!("bad sequence {}", sequence)))?,
            ),
            None => 0,
        };
        let next = current + 1;
        self.db.put_cf(cf, sequence.as_bytes(), next.to_be_bytes())?;
        Ok(next)
    }

    fn put_driver(&self, driver: &Driver) -> Result<()> {
        let value = bincode::serialize(driver)?;
        self.db
            .put_cf(self.cf(CF_DRIVERS)?, driver.id.to_be_bytes(), value)?;
        Ok(())
    }

    fn load_driver(&self, id: DriverId) -> Result<Option<Driver>> {
        match self.db.get_cf(self.cf(CF_DRIVERS)?, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RocksStateStore {
    async fn create_driver(&self, name: &str) -> Result<Driver> {
        let name = validate_name(name)?;
        let _guard = self.guard()?;
        let driver = Driver {
            id: self.next_id(SEQ_DRIVER)?,
            name: name.to_string(),
            state: None,
            created_at: Utc::now(),
        };
        self.put_driver(&driver)?;
        Ok(driver)
    }

    async fn create_passenger(&self, name: &str) -> Result<Passenger> {
        let name = validate_name(name)?;
        let _guard = self.guard()?;
        let passenger = Passenger {
            id: self.next_id(SEQ_PASSENGER)?,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let value = bincode::serialize(&passenger)?;
        self.db
            .put_cf(self.cf(CF_PASSENGERS)?, passenger.id.to_be_bytes(), value)?;
        Ok(passenger)
    }

    async fn get_driver(&self, id: DriverId) -> Result<Option<Driver>> {
        self.load_driver(id)
    }

    async fn get_passenger(&self, id: PassengerId) -> Result<Option<Passenger>> {
        match self.db.get_cf(self.cf(CF_PASSENGERS)?, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_state(&self, id: DriverId, state: DriverState) -> Result<Option<DriverState>> {
        let _guard = self.guard()?;
        let mut driver = self
            .load_driver(id)?
            .ok_or_else(|| Error::NotFound(format!("driver {}", id)))?;
        let previous = driver.state.replace(state);
        if previous != Some(state) {
            self.put_driver(&driver)?;
        }
        Ok(previous)
    }

    async fn list_drivers(&self) -> Result<Vec<Driver>> {
        let iter = self.db.iterator_cf(self.cf(CF_DRIVERS)?, IteratorMode::Start);

        let mut drivers = Vec::new();
        for item in iter {
            let (_, value) = item?;
            drivers.push(bincode::deserialize(&value)?);
        }

        Ok(drivers)
    }
}
