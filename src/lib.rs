//! # geodispatch
//!
//! Driver location and dispatch coordination engine:
//! - State store as the record of drivers, passengers and availability
//! - Append-only location history per driver
//! - H3-bucketed geo index of available drivers for nearest-driver search
//! - A coordinator that keeps the index consistent with the other two
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!  HTTP ───▶ │     DispatchCoordinator      │ ◀── reconciler (periodic)
//!            │  per-driver locks, timeouts, │
//!            │  radius ladder, repair       │
//!            └──────┬──────────┬─────────┬──┘
//!                   │          │         │
//!           ┌───────▼───┐ ┌────▼──────┐ ┌▼──────────┐
//!           │StateStore │ │HistoryLog │ │ GeoIndex  │
//!           │ (RocksDB) │ │ (file log)│ │ (H3 cells)│
//!           └───────────┘ └───────────┘ └───────────┘
//! ```
//!
//! State store and history log are the durable path: their failures fail
//! the request. The geo index is derived from them and repaired in the
//! background when a write to it fails.
//!
//! ## Usage
//!
//! ### Start the server
//! ```bash
//! geodispatch-server serve \
//!   --bind 0.0.0.0:8080 \
//!   --state-path ./data/state \
//!   --history-path ./data/locations.log
//! ```
//!
//! ### Use the CLI
//! ```bash
//! geodispatch add-driver Alice
//! geodispatch locate 1 --lat 10.0 --lng 106.0
//! geodispatch state 1 available
//! geodispatch request 1 --lat 10.0 --lng 106.0
//! ```

pub mod api;
pub mod common;
pub mod dispatch;
pub mod model;
pub mod store;

// Re-export commonly used types
pub use api::DispatchServer;
pub use common::{Config, Error, Result};
pub use dispatch::{DispatchCoordinator, IndexUpdate};
pub use store::Stores;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
