//! Store outages: degraded index writes, durable-path failures, timeouts

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geodispatch::common::DispatchConfig;
use geodispatch::model::{
    Candidate, Driver, DriverId, DriverState, GeoEntry, LocationSample, Passenger, PassengerId,
};
use geodispatch::store::{
    GeoIndex, H3GeoIndex, HistoryLog, MemoryHistoryLog, MemoryStateStore, StateStore,
};
use geodispatch::{DispatchCoordinator, Error, IndexUpdate, Result, Stores};
use h3o::Resolution;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        store_timeout_ms: 50,
        store_retries: 5,
        retry_backoff_ms: 5,
        ..DispatchConfig::default()
    }
}

/// Geo index that fails (or stalls) on demand
#[derive(Default)]
struct FlakyGeo {
    inner: Option<H3GeoIndex>,
    failing: AtomicBool,
    stalling: AtomicBool,
}

impl FlakyGeo {
    fn new() -> Self {
        Self {
            inner: Some(H3GeoIndex::new(Resolution::Seven)),
            ..Default::default()
        }
    }

    fn inner(&self) -> &H3GeoIndex {
        self.inner.as_ref().unwrap()
    }

    async fn gate(&self) -> Result<()> {
        if self.stalling.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Internal("geo backend down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl GeoIndex for FlakyGeo {
    async fn upsert(&self, driver_id: DriverId, lat: f64, lng: f64) -> Result<()> {
        self.gate().await?;
        self.inner().upsert(driver_id, lat, lng).await
    }

    async fn remove(&self, driver_id: DriverId) -> Result<()> {
        self.gate().await?;
        self.inner().remove(driver_id).await
    }

    async fn get(&self, driver_id: DriverId) -> Result<Option<GeoEntry>> {
        self.gate().await?;
        self.inner().get(driver_id).await
    }

    async fn query_nearest(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        self.gate().await?;
        self.inner().query_nearest(lat, lng, radius_km, limit).await
    }

    async fn driver_ids(&self) -> Result<Vec<DriverId>> {
        self.gate().await?;
        self.inner().driver_ids().await
    }
}

/// History log whose appends fail on demand, counting attempts
#[derive(Default)]
struct FlakyHistory {
    inner: MemoryHistoryLog,
    failing: AtomicBool,
    appends: AtomicUsize,
}

#[async_trait]
impl HistoryLog for FlakyHistory {
    async fn append(&self, sample: &LocationSample) -> Result<()> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::unavailable("history log", "disk offline"));
        }
        self.inner.append(sample).await
    }

    async fn query(&self, driver_id: DriverId, since: DateTime<Utc>) -> Result<Vec<LocationSample>> {
        self.inner.query(driver_id, since).await
    }

    async fn latest(&self, driver_id: DriverId) -> Result<Option<LocationSample>> {
        self.inner.latest(driver_id).await
    }
}

/// State store that applies the next state change but loses the reply
#[derive(Default)]
struct LossyAckState {
    inner: MemoryStateStore,
    drop_next_ack: AtomicBool,
}

#[async_trait]
impl StateStore for LossyAckState {
    async fn create_driver(&self, name: &str) -> Result<Driver> {
        self.inner.create_driver(name).await
    }

    async fn create_passenger(&self, name: &str) -> Result<Passenger> {
        self.inner.create_passenger(name).await
    }

    async fn get_driver(&self, id: DriverId) -> Result<Option<Driver>> {
        self.inner.get_driver(id).await
    }

    async fn get_passenger(&self, id: PassengerId) -> Result<Option<Passenger>> {
        self.inner.get_passenger(id).await
    }

    async fn set_state(&self, id: DriverId, state: DriverState) -> Result<Option<DriverState>> {
        let previous = self.inner.set_state(id, state).await?;
        if self.drop_next_ack.swap(false, Ordering::SeqCst) {
            return Err(Error::unavailable("state store", "connection reset"));
        }
        Ok(previous)
    }

    async fn list_drivers(&self) -> Result<Vec<Driver>> {
        self.inner.list_drivers().await
    }
}

struct Harness {
    coordinator: DispatchCoordinator,
    geo: Arc<FlakyGeo>,
    history: Arc<FlakyHistory>,
    state: Arc<LossyAckState>,
}

fn harness() -> Harness {
    let geo = Arc::new(FlakyGeo::new());
    let history = Arc::new(FlakyHistory::default());
    let state = Arc::new(LossyAckState::default());
    let stores = Stores {
        state: state.clone(),
        history: history.clone(),
        geo: geo.clone(),
    };
    Harness {
        coordinator: DispatchCoordinator::new(stores, fast_config()),
        geo,
        history,
        state,
    }
}

async fn wait_for_entry(geo: &FlakyGeo, driver_id: DriverId) -> Option<GeoEntry> {
    for _ in 0..100 {
        if let Some(entry) = geo.inner().get(driver_id).await.unwrap() {
            return Some(entry);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

#[tokio::test]
async fn test_degraded_index_write_is_repaired() {
    let h = harness();
    let c = &h.coordinator;
    let d = c.create_driver("Alice").await.unwrap();
    c.set_state(d.id, DriverState::Available).await.unwrap();

    h.geo.failing.store(true, Ordering::SeqCst);
    let update = c.update_location(d.id, 10.0, 106.0).await.unwrap();
    assert_eq!(update.index, IndexUpdate::Pending);

    // accepted: the sample is durable even though the index missed it
    assert!(h.history.latest(d.id).await.unwrap().is_some());
    assert!(h.geo.inner().get(d.id).await.unwrap().is_none());

    h.geo.failing.store(false, Ordering::SeqCst);
    let entry = wait_for_entry(&h.geo, d.id)
        .await
        .expect("background repair should restore the entry");
    assert!(entry.same_position(10.0, 106.0));
}

#[tokio::test]
async fn test_degraded_removal_is_repaired() {
    let h = harness();
    let c = &h.coordinator;
    let d = c.create_driver("Alice").await.unwrap();
    c.update_location(d.id, 10.0, 106.0).await.unwrap();
    c.set_state(d.id, DriverState::Available).await.unwrap();

    h.geo.failing.store(true, Ordering::SeqCst);
    let change = c.set_state(d.id, DriverState::Busy).await.unwrap();
    assert_eq!(change.index, IndexUpdate::Pending);
    h.geo.failing.store(false, Ordering::SeqCst);

    let mut removed = false;
    for _ in 0..100 {
        if h.geo.inner().get(d.id).await.unwrap().is_none() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(removed);
}

#[tokio::test]
async fn test_history_outage_fails_update() {
    let h = harness();
    let c = &h.coordinator;
    let d = c.create_driver("Alice").await.unwrap();
    c.set_state(d.id, DriverState::Available).await.unwrap();

    h.history.failing.store(true, Ordering::SeqCst);
    let err = c.update_location(d.id, 10.0, 106.0).await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable { .. }));
    assert_eq!(err.to_http_status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);

    // retried up to the configured bound, and nothing reached the index
    assert_eq!(
        h.history.appends.load(Ordering::SeqCst),
        fast_config().store_retries
    );
    assert!(h.geo.inner().get(d.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stalled_index_times_out() {
    let h = harness();
    let c = &h.coordinator;
    let d = c.create_driver("Alice").await.unwrap();
    c.set_state(d.id, DriverState::Available).await.unwrap();

    h.geo.stalling.store(true, Ordering::SeqCst);
    let update = tokio::time::timeout(
        Duration::from_secs(1),
        c.update_location(d.id, 10.0, 106.0),
    )
    .await
    .expect("store deadline should bound the call")
    .unwrap();
    assert_eq!(update.index, IndexUpdate::Pending);

    let err = c.nearest_drivers(10.0, 106.0, 5.0, 5).await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable { .. }));

    h.geo.stalling.store(false, Ordering::SeqCst);
    assert!(wait_for_entry(&h.geo, d.id).await.is_some());
}

#[tokio::test]
async fn test_lost_state_ack_still_updates_index() {
    let h = harness();
    let c = &h.coordinator;
    let d = c.create_driver("Alice").await.unwrap();
    c.update_location(d.id, 10.0, 106.0).await.unwrap();

    // first attempt lands, its reply is lost, the retry sees the new state
    h.state.drop_next_ack.store(true, Ordering::SeqCst);
    let change = c.set_state(d.id, DriverState::Available).await.unwrap();
    assert_eq!(change.previous, Some(DriverState::Available));
    assert_eq!(change.index, IndexUpdate::Applied);
    assert!(h.geo.inner().get(d.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_reconcile_survives_partial_outage() {
    let h = harness();
    let c = &h.coordinator;
    let d = c.create_driver("Alice").await.unwrap();
    c.update_location(d.id, 10.0, 106.0).await.unwrap();
    c.set_state(d.id, DriverState::Available).await.unwrap();

    h.geo.failing.store(true, Ordering::SeqCst);
    assert!(c.reconcile().await.is_err());

    h.geo.failing.store(false, Ordering::SeqCst);
    h.geo.inner().remove(d.id).await.unwrap();
    let report = c.reconcile().await.unwrap();
    assert_eq!(report.entries_added, 1);
    assert_eq!(report.failures, 0);
}
