//! Authentication primitives for the Monarch session.
//!
//! This module provides:
//! - `Credentials`: login input loaded once from the environment
//! - `totp`: time-based one-time codes for unattended MFA
//! - `Session` / `SessionStore`: the session handle and its on-disk record
//!
//! The state machine that ties these together lives in `crate::lifecycle`.

pub mod credentials;
pub mod session;
pub mod totp;

pub use credentials::Credentials;
pub use session::{PersistedSession, Session, SessionStore};
