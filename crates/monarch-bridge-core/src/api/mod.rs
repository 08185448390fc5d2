//! Remote client module for the Monarch Money service.
//!
//! This module provides the `RemoteClient` capability seam and its
//! reqwest-backed `MonarchClient`. Authentication uses an opaque session
//! token sent as `Authorization: Token <token>`.

pub mod client;
pub mod error;

pub use client::{LoginResponse, MonarchClient, RemoteClient};
pub use error::ApiError;
