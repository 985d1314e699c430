//! Domain records shared by the stores and the coordinator

use crate::common::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type DriverId = i64;
pub type PassengerId = i64;

/// Driver availability as recorded in the state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    Available,
    Busy,
}

impl DriverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverState::Available => "available",
            DriverState::Busy => "busy",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(DriverState::Available),
            "busy" => Ok(DriverState::Busy),
            other => Err(Error::Validation(format!("Invalid state: {:?}", other))),
        }
    }
}

/// Driver row. `state` is `None` until the first transition is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub name: String,
    pub state: Option<DriverState>,
    pub created_at: DateTime<Utc>,
}

impl Driver {
    pub fn is_available(&self) -> bool {
        self.state == Some(DriverState::Available)
    }
}

/// Passenger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passenger {
    pub id: PassengerId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One immutable location observation in the history log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub driver_id: DriverId,
    pub lat: f64,
    pub lng: f64,
    pub observed_at: DateTime<Utc>,
}

/// Live position of an available driver in the geo index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoEntry {
    pub driver_id: DriverId,
    pub lat: f64,
    pub lng: f64,
}

impl GeoEntry {
    pub fn same_position(&self, lat: f64, lng: f64) -> bool {
        self.lat == lat && self.lng == lng
    }
}

impl From<&LocationSample> for GeoEntry {
    fn from(sample: &LocationSample) -> Self {
        Self {
            driver_id: sample.driver_id,
            lat: sample.lat,
            lng: sample.lng,
        }
    }
}

/// A nearest-driver query hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub lat: f64,
    pub lng: f64,
    pub distance_km: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state() {
        assert_eq!(
            "available".parse::<DriverState>().unwrap(),
            DriverState::Available
        );
        assert_eq!("busy".parse::<DriverState>().unwrap(), DriverState::Busy);
        assert!(matches!(
            "offline".parse::<DriverState>(),
            Err(Error::Validation(_))
        ));
        assert!("".parse::<DriverState>().is_err());
        assert!("Available".parse::<DriverState>().is_err());
    }

    #[test]
    fn test_state_display_round_trips() {
        for state in [DriverState::Available, DriverState::Busy] {
            assert_eq!(state.to_string().parse::<DriverState>().unwrap(), state);
        }
    }
}
