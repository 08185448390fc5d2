//! Caller-facing error taxonomy for session and transaction operations.
//!
//! Every variant carries a stable machine code so the HTTP layer (and any
//! workflow engine behind it) can tell auth failures apart from transient
//! faults and input errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("MFA code was rejected")]
    InvalidMfaCode,

    #[error("No MFA challenge is pending")]
    NoPendingChallenge,

    #[error("Session expired - login required")]
    SessionExpired,

    #[error("Remote service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Login timed out waiting for the remote service")]
    LoginTimeout,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session storage error: {0}")]
    Storage(String),
}

impl BridgeError {
    /// Stable snake_case code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::AuthRejected(_) => "auth_rejected",
            BridgeError::InvalidMfaCode => "invalid_code",
            BridgeError::NoPendingChallenge => "no_pending_challenge",
            BridgeError::SessionExpired => "session_expired",
            BridgeError::RemoteUnavailable(_) => "remote_unavailable",
            BridgeError::LoginTimeout => "login_timeout",
            BridgeError::ValidationError(_) => "validation_error",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::Storage(_) => "storage_error",
        }
    }

    /// Whether retrying the same call later may succeed without caller action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::RemoteUnavailable(_) | BridgeError::LoginTimeout
        )
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
