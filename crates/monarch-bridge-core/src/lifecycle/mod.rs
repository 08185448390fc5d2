//! Session lifecycle: the auth/MFA state machine and the keep-alive loop.

pub mod keep_alive;
pub mod manager;

pub use keep_alive::{KeepAlive, TickOutcome};
pub use manager::{AuthState, LoginOutcome, SessionManager, SessionStatus, MAX_MFA_ATTEMPTS};
