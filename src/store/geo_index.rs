//! Live geo index of available drivers
//!
//! Entries are bucketed by H3 cell at a fixed resolution. A radius query
//! walks the k-ring of cells around the query point that is guaranteed to
//! cover the radius, then filters by exact haversine distance. When that
//! ring would hold more cells than the index holds entries, a linear scan
//! is cheaper and is used instead.
//!
//! # Thread Safety
//!
//! - Entry and cell maps are `DashMap`s: readers never block each other
//! - Writers take a short mutex so an entry and its cell membership change
//!   together

use crate::common::geo::haversine_km;
use crate::common::{Error, Result};
use crate::model::{Candidate, DriverId, GeoEntry};
use crate::store::GeoIndex;
use async_trait::async_trait;
use dashmap::DashMap;
use h3o::{CellIndex, LatLng, Resolution};
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Slot {
    entry: GeoEntry,
    cell: CellIndex,
}

/// H3 cell → driver mapping plus driver → entry lookup
pub struct H3GeoIndex {
    resolution: Resolution,
    entries: DashMap<DriverId, Slot>,
    cells: DashMap<CellIndex, HashSet<DriverId>>,
    writer: Mutex<()>,
}

impl H3GeoIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            entries: DashMap::new(),
            cells: DashMap::new(),
            writer: Mutex::new(()),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cell_of(&self, lat: f64, lng: f64) -> Result<CellIndex> {
        let ll = LatLng::new(lat, lng)
            .map_err(|e| Error::validation(format!("Invalid coordinates: {}", e)))?;
        Ok(ll.to_cell(self.resolution))
    }

    /// Smallest k whose k-ring covers every point within `radius_km` of any
    /// point of the origin cell. Neighbouring centres are ~sqrt(3) edges
    /// apart and the smallest cells at a resolution are about half the
    /// average area, so one average edge per ring plus one spare ring is
    /// enough.
    fn ring_size(&self, radius_km: f64) -> u32 {
        let edge = self.resolution.edge_length_km();
        ((radius_km / edge).ceil() as u32).saturating_add(1)
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|_| Error::Internal("geo index lock poisoned".into()))
    }

    fn detach(&self, driver_id: DriverId, cell: CellIndex) {
        if let Some(mut members) = self.cells.get_mut(&cell) {
            members.remove(&driver_id);
        }
        self.cells.remove_if(&cell, |_, members| members.is_empty());
    }

    fn candidate(slot: &Slot, lat: f64, lng: f64) -> Candidate {
        Candidate {
            driver_id: slot.entry.driver_id,
            lat: slot.entry.lat,
            lng: slot.entry.lng,
            distance_km: haversine_km(lat, lng, slot.entry.lat, slot.entry.lng),
        }
    }

    fn scan_rings(&self, origin: CellIndex, k: u32, lat: f64, lng: f64) -> Vec<Candidate> {
        let mut hits = Vec::new();
        for cell in origin.grid_disk::<Vec<_>>(k) {
            let Some(members) = self.cells.get(&cell) else {
                continue;
            };
            for driver_id in members.iter() {
                if let Some(slot) = self.entries.get(driver_id) {
                    // a concurrent move may leave a stale membership behind
                    if slot.cell == cell {
                        hits.push(Self::candidate(&slot, lat, lng));
                    }
                }
            }
        }
        hits
    }

    fn scan_all(&self, lat: f64, lng: f64) -> Vec<Candidate> {
        self.entries
            .iter()
            .map(|slot| Self::candidate(&slot, lat, lng))
            .collect()
    }
}

/// Ring cell count for k rings: 3k(k+1) + 1
fn disk_cells(k: u32) -> u64 {
    let k = k as u64;
    k.saturating_mul(k + 1).saturating_mul(3).saturating_add(1)
}

#[async_trait]
impl GeoIndex for H3GeoIndex {
    async fn upsert(&self, driver_id: DriverId, lat: f64, lng: f64) -> Result<()> {
        let cell = self.cell_of(lat, lng)?;
        let _writer = self.lock_writer()?;

        let slot = Slot {
            entry: GeoEntry {
                driver_id,
                lat,
                lng,
            },
            cell,
        };
        if let Some(old) = self.entries.insert(driver_id, slot) {
            if old.cell == cell {
                return Ok(());
            }
            self.detach(driver_id, old.cell);
        }
        self.cells.entry(cell).or_default().insert(driver_id);
        Ok(())
    }

    async fn remove(&self, driver_id: DriverId) -> Result<()> {
        let _writer = self.lock_writer()?;
        if let Some((_, old)) = self.entries.remove(&driver_id) {
            self.detach(driver_id, old.cell);
        }
        Ok(())
    }

    async fn get(&self, driver_id: DriverId) -> Result<Option<GeoEntry>> {
        Ok(self.entries.get(&driver_id).map(|slot| slot.entry))
    }

    async fn query_nearest(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if limit == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        let origin = self.cell_of(lat, lng)?;
        let k = self.ring_size(radius_km);

        let mut hits = if disk_cells(k) > self.entries.len() as u64 {
            self.scan_all(lat, lng)
        } else {
            self.scan_rings(origin, k, lat, lng)
        };

        hits.retain(|c| c.distance_km <= radius_km);
        hits.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then(a.driver_id.cmp(&b.driver_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn driver_ids(&self) -> Result<Vec<DriverId>> {
        let mut ids: Vec<DriverId> = self.entries.iter().map(|slot| *slot.key()).collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> H3GeoIndex {
        H3GeoIndex::new(Resolution::Seven)
    }

    /// Offset north by `km` (111.19 km per degree of latitude)
    fn north_of(lat: f64, km: f64) -> f64 {
        lat + km / 111.19
    }

    #[tokio::test]
    async fn test_upsert_replaces_single_entry() {
        let geo = index();
        geo.upsert(1, 10.0, 106.0).await.unwrap();
        geo.upsert(1, 10.0, 106.0).await.unwrap();
        assert_eq!(geo.len(), 1);

        geo.upsert(1, 10.5, 106.5).await.unwrap();
        assert_eq!(geo.len(), 1);
        let entry = geo.get(1).await.unwrap().unwrap();
        assert_eq!((entry.lat, entry.lng), (10.5, 106.5));

        // the old cell no longer lists the driver
        let near_old = geo.query_nearest(10.0, 106.0, 1.0, 10).await.unwrap();
        assert!(near_old.is_empty());
        assert_eq!(geo.cells.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_is_ok() {
        let geo = index();
        geo.remove(7).await.unwrap();
        geo.upsert(7, 10.0, 106.0).await.unwrap();
        geo.remove(7).await.unwrap();
        assert!(geo.get(7).await.unwrap().is_none());
        assert!(geo.cells.is_empty());
    }

    #[tokio::test]
    async fn test_query_orders_by_distance_then_id() {
        let geo = index();
        geo.upsert(3, north_of(10.0, 2.0), 106.0).await.unwrap();
        geo.upsert(2, north_of(10.0, 1.0), 106.0).await.unwrap();
        geo.upsert(1, north_of(10.0, 1.0), 106.0).await.unwrap();
        geo.upsert(4, north_of(10.0, 30.0), 106.0).await.unwrap();

        let hits = geo.query_nearest(10.0, 106.0, 5.0, 10).await.unwrap();
        let ids: Vec<DriverId> = hits.iter().map(|c| c.driver_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!((hits[0].distance_km - 1.0).abs() < 0.01);

        let limited = geo.query_nearest(10.0, 106.0, 5.0, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_ring_scan_matches_linear_scan() {
        let geo = index();
        // dense enough that the ring path is taken for small radii
        let mut id = 0;
        for i in 0..40 {
            for j in 0..40 {
                id += 1;
                geo.upsert(id, 10.0 + i as f64 * 0.01, 106.0 + j as f64 * 0.01)
                    .await
                    .unwrap();
            }
        }
        let (lat, lng, radius) = (10.2, 106.2, 3.0);
        let k = geo.ring_size(radius);
        assert!(disk_cells(k) <= geo.len() as u64);

        let mut expected = geo.scan_all(lat, lng);
        expected.retain(|c| c.distance_km <= radius);

        let hits = geo
            .query_nearest(lat, lng, radius, usize::MAX)
            .await
            .unwrap();
        assert_eq!(hits.len(), expected.len());
        assert!(!hits.is_empty());
    }

    #[tokio::test]
    async fn test_query_respects_radius_boundary() {
        let geo = index();
        geo.upsert(1, north_of(0.0, 4.9), 0.0).await.unwrap();
        geo.upsert(2, north_of(0.0, 5.1), 0.0).await.unwrap();
        let hits = geo.query_nearest(0.0, 0.0, 5.0, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].driver_id, 1);
    }

    #[tokio::test]
    async fn test_invalid_coordinates_rejected() {
        let geo = index();
        assert!(geo.upsert(1, f64::NAN, 0.0).await.is_err());
    }
}
