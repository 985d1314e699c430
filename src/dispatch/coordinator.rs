//! Dispatch coordinator
//!
//! Sequences writes across the three stores so that, once a driver goes
//! quiet, the geo index holds an entry for it exactly when the state store
//! says it is available and a last known location exists.
//!
//! Ordering per driver, always under that driver's lock:
//! - location update: history append, then (if available) geo upsert
//! - state change: state store write, then geo remove or upsert from the
//!   latest history sample
//!
//! History and state-store calls sit on the durable path: they time out,
//! retry on `StoreUnavailable`, and fail the operation if they keep failing.
//! Geo index calls only time out; a failure is logged, the caller sees
//! [`IndexUpdate::Pending`], and a background repair re-derives the entry.

use crate::common::config::DispatchConfig;
use crate::common::utils::{retry_with_backoff, validate_coordinates, validate_name, with_timeout};
use crate::common::{Error, Result};
use crate::dispatch::ladder::RadiusLadder;
use crate::dispatch::locks::DriverLocks;
use crate::model::{
    Candidate, Driver, DriverId, DriverState, LocationSample, Passenger, PassengerId,
};
use crate::store::Stores;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

pub(crate) const STATE_STORE: &str = "state store";
pub(crate) const HISTORY_LOG: &str = "history log";
pub(crate) const GEO_INDEX: &str = "geo index";

/// What happened to the geo index as a side effect of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexUpdate {
    /// Entry inserted or moved
    Applied,
    /// Entry removed
    Removed,
    /// Nothing to do: driver not available, or no known location
    Skipped,
    /// State did not change, index left alone
    Unchanged,
    /// Index write failed; a background repair will converge it
    Pending,
}

/// Result of an accepted location update
#[derive(Debug, Clone, Serialize)]
pub struct LocationUpdate {
    pub sample: LocationSample,
    pub index: IndexUpdate,
}

/// Result of an accepted state change
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StateChange {
    pub driver_id: DriverId,
    pub previous: Option<DriverState>,
    pub current: DriverState,
    pub index: IndexUpdate,
}

/// Cheap to clone; clones share stores and the lock table.
#[derive(Clone)]
pub struct DispatchCoordinator {
    pub(crate) stores: Stores,
    pub(crate) config: DispatchConfig,
    pub(crate) locks: Arc<DriverLocks>,
    ladder: RadiusLadder,
}

impl DispatchCoordinator {
    pub fn new(stores: Stores, config: DispatchConfig) -> Self {
        Self {
            ladder: RadiusLadder::from_config(&config),
            stores,
            config,
            locks: Arc::new(DriverLocks::new()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Durable-path call: deadline per attempt, bounded retries.
    pub(crate) async fn durable<T, F, Fut>(&self, store: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.store_timeout();
        retry_with_backoff(
            || with_timeout(store, timeout, call()),
            self.config.store_retries,
            self.config.retry_backoff(),
        )
        .await
    }

    /// Single attempt under the store deadline.
    pub(crate) async fn timed<T, Fut>(&self, store: &'static str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        with_timeout(store, self.config.store_timeout(), fut).await
    }

    async fn require_driver(&self, driver_id: DriverId) -> Result<Driver> {
        self.durable(STATE_STORE, || self.stores.state.get_driver(driver_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("driver {}", driver_id)))
    }

    pub async fn create_driver(&self, name: &str) -> Result<Driver> {
        let name = validate_name(name)?;
        // not retried: a timed-out insert may still have assigned an id
        let driver = self
            .timed(STATE_STORE, self.stores.state.create_driver(name))
            .await?;
        tracing::info!("Created driver {} ({})", driver.id, driver.name);
        Ok(driver)
    }

    pub async fn create_passenger(&self, name: &str) -> Result<Passenger> {
        let name = validate_name(name)?;
        let passenger = self
            .timed(STATE_STORE, self.stores.state.create_passenger(name))
            .await?;
        tracing::info!("Created passenger {} ({})", passenger.id, passenger.name);
        Ok(passenger)
    }

    pub async fn get_driver(&self, driver_id: DriverId) -> Result<Driver> {
        self.require_driver(driver_id).await
    }

    /// Record a location sample and, for an available driver, move its
    /// geo entry.
    ///
    /// The history append must succeed for the update to be accepted. The
    /// geo step may degrade to [`IndexUpdate::Pending`].
    pub async fn update_location(
        &self,
        driver_id: DriverId,
        lat: f64,
        lng: f64,
    ) -> Result<LocationUpdate> {
        validate_coordinates(lat, lng)?;
        let _guard = self.locks.acquire(driver_id).await;

        let driver = self.require_driver(driver_id).await?;
        let sample = LocationSample {
            driver_id,
            lat,
            lng,
            observed_at: Utc::now(),
        };
        self.durable(HISTORY_LOG, || self.stores.history.append(&sample))
            .await?;

        // state cannot change while the lock is held
        if !driver.is_available() {
            tracing::debug!(
                driver_id,
                state = ?driver.state,
                "location recorded, driver not matchable"
            );
            return Ok(LocationUpdate {
                sample,
                index: IndexUpdate::Skipped,
            });
        }

        let index = match self
            .timed(GEO_INDEX, self.stores.geo.upsert(driver_id, lat, lng))
            .await
        {
            Ok(()) => IndexUpdate::Applied,
            Err(e) => self.degrade(driver_id, e),
        };
        tracing::debug!(driver_id, lat, lng, ?index, "location updated");
        Ok(LocationUpdate { sample, index })
    }

    /// Change a driver's availability and bring the geo index along.
    pub async fn set_state(&self, driver_id: DriverId, state: DriverState) -> Result<StateChange> {
        let _guard = self.locks.acquire(driver_id).await;

        let mut attempts = 0;
        let previous = self
            .durable(STATE_STORE, || {
                attempts += 1;
                self.stores.state.set_state(driver_id, state)
            })
            .await?;

        // after a retry the first attempt may have landed unseen, so only a
        // first-try match proves the index was already in step
        if previous == Some(state) && attempts == 1 {
            tracing::debug!(driver_id, %state, "state unchanged");
            return Ok(StateChange {
                driver_id,
                previous,
                current: state,
                index: IndexUpdate::Unchanged,
            });
        }

        let index = match state {
            DriverState::Busy => match self
                .timed(GEO_INDEX, self.stores.geo.remove(driver_id))
                .await
            {
                Ok(()) => IndexUpdate::Removed,
                Err(e) => self.degrade(driver_id, e),
            },
            DriverState::Available => self.index_latest(driver_id).await,
        };

        tracing::info!(
            "Driver {} state {} -> {} (index {:?})",
            driver_id,
            previous.map(|s| s.as_str()).unwrap_or("unknown"),
            state,
            index
        );
        Ok(StateChange {
            driver_id,
            previous,
            current: state,
            index,
        })
    }

    /// Re-add a newly available driver at its last known location.
    async fn index_latest(&self, driver_id: DriverId) -> IndexUpdate {
        let latest = match self
            .timed(HISTORY_LOG, self.stores.history.latest(driver_id))
            .await
        {
            Ok(latest) => latest,
            Err(e) => return self.degrade(driver_id, e),
        };
        let Some(sample) = latest else {
            tracing::debug!(driver_id, "available without a known location");
            return IndexUpdate::Skipped;
        };
        match self
            .timed(
                GEO_INDEX,
                self.stores.geo.upsert(driver_id, sample.lat, sample.lng),
            )
            .await
        {
            Ok(()) => IndexUpdate::Applied,
            Err(e) => self.degrade(driver_id, e),
        }
    }

    fn degrade(&self, driver_id: DriverId, error: Error) -> IndexUpdate {
        tracing::warn!(
            driver_id,
            error = %error,
            "geo index update failed, scheduling repair"
        );
        self.schedule_repair(driver_id);
        IndexUpdate::Pending
    }

    /// Retry the driver's index repair in the background with backoff.
    /// Whatever is still wrong after the last attempt is left to the
    /// periodic reconciliation sweep.
    fn schedule_repair(&self, driver_id: DriverId) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut delay = coordinator.config.retry_backoff();
            for attempt in 1..=coordinator.config.store_retries {
                tokio::time::sleep(delay).await;
                match coordinator.repair_driver(driver_id).await {
                    Ok(repair) => {
                        tracing::debug!(driver_id, attempt, ?repair, "background repair done");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(driver_id, attempt, error = %e, "background repair failed");
                        delay *= 2;
                    }
                }
            }
            tracing::warn!(
                "Giving up on index repair for driver {}; next reconciliation will retry",
                driver_id
            );
        });
    }

    /// Nearest available drivers, widening the radius until `limit` are
    /// found or the configured maximum radius has been searched.
    ///
    /// Read-only and lock-free. Dropping the future between rungs cancels
    /// the search without side effects.
    pub async fn nearest_drivers(
        &self,
        lat: f64,
        lng: f64,
        initial_radius_km: f64,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        validate_coordinates(lat, lng)?;
        if !initial_radius_km.is_finite() || initial_radius_km <= 0.0 {
            return Err(Error::validation(format!(
                "Invalid radius: {}",
                initial_radius_km
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for radius_km in self.ladder.starting_at(initial_radius_km).rungs() {
            found = self
                .timed(
                    GEO_INDEX,
                    self.stores.geo.query_nearest(lat, lng, radius_km, limit),
                )
                .await?;
            tracing::debug!(radius_km, found = found.len(), limit, "nearest-driver query");
            if found.len() >= limit {
                break;
            }
        }
        Ok(found)
    }

    /// Candidate drivers for a passenger's ride request, using the
    /// configured starting radius and candidate count.
    pub async fn request_ride(
        &self,
        passenger_id: PassengerId,
        lat: f64,
        lng: f64,
    ) -> Result<Vec<Candidate>> {
        if passenger_id <= 0 {
            return Err(Error::validation(format!(
                "Invalid passenger id: {}",
                passenger_id
            )));
        }
        let candidates = self
            .nearest_drivers(
                lat,
                lng,
                self.config.initial_radius_km,
                self.config.max_candidates,
            )
            .await?;
        tracing::info!(
            "Ride request from passenger {}: {} candidate(s)",
            passenger_id,
            candidates.len()
        );
        Ok(candidates)
    }

    /// Location samples after `since` (default: the configured window back
    /// from now), oldest first.
    pub async fn driver_history(
        &self,
        driver_id: DriverId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LocationSample>> {
        self.require_driver(driver_id).await?;
        let since = since.unwrap_or_else(|| {
            Utc::now() - ChronoDuration::minutes(self.config.history_window_mins)
        });
        self.durable(HISTORY_LOG, || self.stores.history.query(driver_id, since))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h3o::Resolution;

    fn coordinator() -> DispatchCoordinator {
        DispatchCoordinator::new(
            Stores::in_memory(Resolution::Seven),
            DispatchConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_update_location_unknown_driver() {
        let c = coordinator();
        assert!(matches!(
            c.update_location(42, 10.0, 106.0).await,
            Err(Error::NotFound(_))
        ));
        // nothing recorded for the unknown id
        assert!(c.stores.history.latest(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_location_validates_first() {
        let c = coordinator();
        let d = c.create_driver("Alice").await.unwrap();
        assert!(matches!(
            c.update_location(d.id, 91.0, 0.0).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            c.update_location(d.id, 0.0, -180.5).await,
            Err(Error::Validation(_))
        ));
        let ok = c.update_location(d.id, 90.0, 180.0).await.unwrap();
        assert_eq!(ok.index, IndexUpdate::Skipped);
    }

    #[tokio::test]
    async fn test_state_transitions_drive_index() {
        let c = coordinator();
        let d = c.create_driver("Alice").await.unwrap();
        c.update_location(d.id, 10.0, 106.0).await.unwrap();
        assert!(c.stores.geo.get(d.id).await.unwrap().is_none());

        let change = c.set_state(d.id, DriverState::Available).await.unwrap();
        assert_eq!(change.previous, None);
        assert_eq!(change.index, IndexUpdate::Applied);
        assert!(c.stores.geo.get(d.id).await.unwrap().is_some());

        let again = c.set_state(d.id, DriverState::Available).await.unwrap();
        assert_eq!(again.index, IndexUpdate::Unchanged);

        let busy = c.set_state(d.id, DriverState::Busy).await.unwrap();
        assert_eq!(busy.previous, Some(DriverState::Available));
        assert_eq!(busy.index, IndexUpdate::Removed);
        assert!(c.stores.geo.get(d.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_available_without_location_is_skipped() {
        let c = coordinator();
        let d = c.create_driver("Bob").await.unwrap();
        let change = c.set_state(d.id, DriverState::Available).await.unwrap();
        assert_eq!(change.index, IndexUpdate::Skipped);
        assert!(c.stores.geo.get(d.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_state_unknown_driver() {
        let c = coordinator();
        assert!(matches!(
            c.set_state(9, DriverState::Busy).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_nearest_rejects_bad_radius() {
        let c = coordinator();
        assert!(matches!(
            c.nearest_drivers(0.0, 0.0, 0.0, 5).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            c.nearest_drivers(0.0, 0.0, f64::NAN, 5).await,
            Err(Error::Validation(_))
        ));
        assert!(c.nearest_drivers(0.0, 0.0, 5.0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_ride_validates_passenger() {
        let c = coordinator();
        assert!(matches!(
            c.request_ride(0, 10.0, 106.0).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            c.request_ride(1, 10.0, 190.0).await,
            Err(Error::Validation(_))
        ));
        assert!(c.request_ride(1, 10.0, 106.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_of_unknown_driver() {
        let c = coordinator();
        assert!(matches!(
            c.driver_history(5, None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name() {
        let c = coordinator();
        assert!(matches!(
            c.create_driver("   ").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            c.create_passenger("").await,
            Err(Error::Validation(_))
        ));
    }
}
