//! Background keep-alive loop.
//!
//! Pings the remote on a fixed interval (plus a little jitter) while the
//! session is authenticated. Auth failures degrade the session; transient
//! failures are logged and retried on the next tick. While degraded, each
//! tick first re-probes a persisted record that could not be verified, then
//! tries an automatic re-login if credentials are configured.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::auth::Session;
use crate::error::BridgeError;

use super::manager::{AuthState, LoginOutcome, SessionManager};

/// Upper bound on the random delay added to each interval, in seconds.
const MAX_JITTER_SECS: u64 = 10;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Ping succeeded; activity recorded.
    Alive,
    /// Ping was rejected; the session is now degraded.
    Invalidated,
    /// Ping failed for a non-auth reason; state unchanged.
    Transient(String),
    /// A persisted record that could not be probed earlier was verified.
    Restored,
    /// Automatic re-login restored the session.
    Relogged,
    /// Automatic re-login was attempted and did not complete.
    ReloginFailed(String),
    /// Nothing to do in the current state.
    Idle(AuthState),
}

pub struct KeepAlive {
    manager: Arc<SessionManager>,
    interval: Duration,
    jitter: bool,
}

impl KeepAlive {
    pub fn new(manager: Arc<SessionManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub async fn tick(&self) -> TickOutcome {
        self.manager.expire_stale_challenge().await;

        match self.manager.state().await {
            AuthState::Authenticated => self.ping().await,
            state @ (AuthState::Degraded | AuthState::Unauthenticated) => {
                if self.manager.has_unverified_record().await {
                    if self.manager.restore().await {
                        info!("Persisted session verified by keep-alive");
                        return TickOutcome::Restored;
                    }
                    if self.manager.has_unverified_record().await {
                        return TickOutcome::Transient(
                            "persisted session still unverified".to_string(),
                        );
                    }
                }
                if !self.manager.can_auto_login().await {
                    debug!(?state, "Not logged in, skipping keep-alive");
                    return TickOutcome::Idle(state);
                }
                match self.manager.auto_login().await {
                    Ok(LoginOutcome::Authenticated) => {
                        info!("Session re-established by keep-alive");
                        TickOutcome::Relogged
                    }
                    Ok(LoginOutcome::MfaRequired { .. }) => {
                        TickOutcome::ReloginFailed("MFA code required".to_string())
                    }
                    Err(e) => {
                        warn!(error = %e, "Automatic re-login failed (will retry)");
                        TickOutcome::ReloginFailed(e.to_string())
                    }
                }
            }
            state @ AuthState::AwaitingMfa => {
                debug!("MFA challenge pending, skipping keep-alive");
                TickOutcome::Idle(state)
            }
        }
    }

    async fn ping(&self) -> TickOutcome {
        match self.manager.get_valid_session().await {
            Ok(session) => self.ping_with(session).await,
            // Replaced or degraded since the state was read.
            Err(_) => TickOutcome::Idle(self.manager.state().await),
        }
    }

    async fn ping_with(&self, session: Arc<Session>) -> TickOutcome {
        debug!(session_id = session.id(), "Performing keep-alive ping");
        let result = self
            .manager
            .call_with_session(session, |remote, session| async move {
                remote.keep_alive_ping(session.token()).await
            })
            .await;

        match result {
            Ok(()) => {
                if let Err(e) = self.manager.save().await {
                    warn!(error = %e, "Failed to persist keep-alive activity");
                }
                info!("Keep-alive ping successful");
                TickOutcome::Alive
            }
            Err(BridgeError::SessionExpired) => match self.manager.state().await {
                AuthState::Authenticated => {
                    debug!("Ping rejected a session that was already replaced");
                    TickOutcome::Idle(AuthState::Authenticated)
                }
                _ => TickOutcome::Invalidated,
            },
            Err(e) => {
                warn!(error = %e, "Keep-alive ping failed (will retry)");
                TickOutcome::Transient(e.to_string())
            }
        }
    }

    fn next_delay(&self) -> Duration {
        if !self.jitter {
            return self.interval;
        }
        let jitter = {
            use rand::Rng;
            rand::thread_rng().gen_range(0..=MAX_JITTER_SECS)
        };
        self.interval + Duration::from_secs(jitter)
    }

    /// Run until `shutdown` flips or its sender is dropped. Invalidation
    /// wakes the loop early so re-login does not wait a full interval.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Keep-alive started");
            loop {
                let delay = self.next_delay();
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.manager.invalidated() => {
                        debug!("Keep-alive woken by session invalidation");
                    }
                    _ = shutdown.changed() => {
                        info!("Keep-alive stopping");
                        break;
                    }
                }
                self.tick().await;
            }
        })
    }
}
