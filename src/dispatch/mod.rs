//! Dispatch coordination on top of the stores
//!
//! - [`DispatchCoordinator`]: ordered multi-store writes and radius search
//! - [`DriverLocks`]: per-driver serialization
//! - [`RadiusLadder`]: search radius escalation
//! - [`reconcile`]: geo index repair and the periodic sweep

pub mod coordinator;
pub mod ladder;
pub mod locks;
pub mod reconcile;

pub use coordinator::{DispatchCoordinator, IndexUpdate, LocationUpdate, StateChange};
pub use ladder::RadiusLadder;
pub use locks::{DriverGuard, DriverLocks};
pub use reconcile::{spawn_reconciler, ReconcileReport, Repair};
