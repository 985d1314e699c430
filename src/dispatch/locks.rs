//! Per-driver exclusive sections
//!
//! One async mutex per driver id, created on demand in a sharded map and
//! dropped again once nobody holds or waits on it.

use crate::model::DriverId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct DriverLocks {
    table: DashMap<DriverId, Arc<Mutex<()>>>,
}

impl DriverLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `driver_id`.
    pub async fn acquire(&self, driver_id: DriverId) -> DriverGuard<'_> {
        let lock = self.table.entry(driver_id).or_default().clone();
        let guard = lock.lock_owned().await;
        DriverGuard {
            locks: self,
            driver_id,
            guard: Some(guard),
        }
    }

    /// Number of live lock entries
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Held for the duration of a driver's read-modify-write sequence
pub struct DriverGuard<'a> {
    locks: &'a DriverLocks,
    driver_id: DriverId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // only the table's own handle left: no holder, no waiter
        self.locks
            .table
            .remove_if(&self.driver_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
