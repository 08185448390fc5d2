//! monarch-bridge HTTP service.
//!
//! The binary wires `monarch_bridge_core` into an axum router; the router is
//! exposed here so it can be driven in tests without a socket.

pub mod routes;

pub use routes::{create_router, AppState};
