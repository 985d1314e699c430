//! Geo index reconciliation
//!
//! The geo index is derived data: an available driver's entry sits at its
//! latest history sample, every other driver has none. Reconciliation
//! re-derives that per driver and corrects the index where it drifted
//! (degraded writes, crashes between steps, a restart with an empty index).

use crate::common::{Error, Result};
use crate::dispatch::coordinator::{DispatchCoordinator, GEO_INDEX, HISTORY_LOG, STATE_STORE};
use crate::model::{DriverId, GeoEntry};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::JoinHandle;

/// What a single-driver repair did to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Repair {
    InSync,
    Added,
    Removed,
    Refreshed,
}

/// Counts from one reconciliation sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub drivers_checked: usize,
    pub entries_added: usize,
    pub entries_removed: usize,
    pub entries_refreshed: usize,
    pub failures: usize,
}

impl ReconcileReport {
    fn record(&mut self, repair: Repair) {
        match repair {
            Repair::InSync => {}
            Repair::Added => self.entries_added += 1,
            Repair::Removed => self.entries_removed += 1,
            Repair::Refreshed => self.entries_refreshed += 1,
        }
    }

    pub fn corrections(&self) -> usize {
        self.entries_added + self.entries_removed + self.entries_refreshed
    }
}

impl DispatchCoordinator {
    /// Re-derive one driver's geo entry and fix the index if it disagrees.
    pub async fn repair_driver(&self, driver_id: DriverId) -> Result<Repair> {
        let _guard = self.locks.acquire(driver_id).await;
        self.repair_locked(driver_id).await
    }

    /// Caller holds the driver's lock.
    async fn repair_locked(&self, driver_id: DriverId) -> Result<Repair> {
        let driver = self
            .durable(STATE_STORE, || self.stores.state.get_driver(driver_id))
            .await?;

        let desired = match driver {
            Some(driver) if driver.is_available() => self
                .durable(HISTORY_LOG, || self.stores.history.latest(driver_id))
                .await?
                .map(|sample| GeoEntry::from(&sample)),
            _ => None,
        };
        let current = self
            .timed(GEO_INDEX, self.stores.geo.get(driver_id))
            .await?;

        let repair = match (current, desired) {
            (None, None) => Repair::InSync,
            (Some(have), Some(want)) if have.same_position(want.lat, want.lng) => Repair::InSync,
            (Some(_), None) => {
                self.timed(GEO_INDEX, self.stores.geo.remove(driver_id))
                    .await?;
                Repair::Removed
            }
            (None, Some(want)) => {
                self.timed(GEO_INDEX, self.stores.geo.upsert(driver_id, want.lat, want.lng))
                    .await?;
                Repair::Added
            }
            (Some(_), Some(want)) => {
                self.timed(GEO_INDEX, self.stores.geo.upsert(driver_id, want.lat, want.lng))
                    .await?;
                Repair::Refreshed
            }
        };

        if repair != Repair::InSync {
            let drift = Error::InconsistentState(format!(
                "driver {} geo entry {:?} -> {:?}",
                driver_id, current, desired
            ));
            tracing::warn!(driver_id, ?repair, "{}", drift);
        }
        Ok(repair)
    }

    /// Sweep every known driver, then drop index entries for ids the state
    /// store does not know. Per-driver failures are counted and skipped.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let drivers = self
            .durable(STATE_STORE, || self.stores.state.list_drivers())
            .await?;
        let known: HashSet<DriverId> = drivers.iter().map(|d| d.id).collect();

        let mut report = ReconcileReport::default();
        for driver in &drivers {
            report.drivers_checked += 1;
            match self.repair_driver(driver.id).await {
                Ok(repair) => report.record(repair),
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(driver_id = driver.id, error = %e, "reconcile step failed");
                }
            }
        }

        let indexed = self
            .timed(GEO_INDEX, self.stores.geo.driver_ids())
            .await?;
        for driver_id in indexed.into_iter().filter(|id| !known.contains(id)) {
            match self.repair_driver(driver_id).await {
                Ok(repair) => report.record(repair),
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(driver_id, error = %e, "orphan removal failed");
                }
            }
        }

        if report.corrections() > 0 || report.failures > 0 {
            tracing::info!(
                "Reconciled {} drivers: +{} -{} ~{} ({} failed)",
                report.drivers_checked,
                report.entries_added,
                report.entries_removed,
                report.entries_refreshed,
                report.failures
            );
        } else {
            tracing::debug!(drivers = report.drivers_checked, "geo index in sync");
        }
        Ok(report)
    }
}

/// Period used when the sweep is asked to run with a zero interval
const FALLBACK_INTERVAL: Duration = Duration::from_secs(1);

/// Run [`DispatchCoordinator::reconcile`] every `interval`. The first sweep
/// runs immediately, rebuilding the index after a restart.
pub fn spawn_reconciler(coordinator: DispatchCoordinator, interval: Duration) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        tracing::warn!(
            "Reconciliation interval is zero, sweeping every {:?}",
            FALLBACK_INTERVAL
        );
        FALLBACK_INTERVAL
    } else {
        interval
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = coordinator.reconcile().await {
                tracing::error!("Reconciliation sweep failed: {}", e);
            }
        }
    })
}
