//! Core library for monarch-bridge.
//!
//! Keeps one authenticated Monarch Money session alive and lets callers
//! read and update transactions through it:
//!
//! - `lifecycle`: login / MFA state machine, persistence, keep-alive loop
//! - `proxy`: transaction reads and partial updates
//! - `api`: the remote client seam and its HTTP implementation
//! - `auth`: credentials, TOTP, session handle and on-disk store

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod proxy;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::Config;
pub use error::{BridgeError, BridgeResult};
pub use lifecycle::{AuthState, KeepAlive, LoginOutcome, SessionManager, SessionStatus};
pub use proxy::{TransactionProxy, UpdateResult};
