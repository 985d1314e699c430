//! Common utilities and types shared across geodispatch

pub mod config;
pub mod error;
pub mod geo;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, DispatchConfig, HistoryBackend, StateBackend, SyncPolicy};
pub use error::{Error, Result};
pub use geo::haversine_km;
pub use utils::{retry_with_backoff, validate_coordinates, validate_name, with_timeout};
