//! HTTP surface: router and server lifecycle

pub mod http;
pub mod server;

pub use http::{create_router, AppState};
pub use server::DispatchServer;
