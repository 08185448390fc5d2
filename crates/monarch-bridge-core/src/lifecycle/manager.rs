//! Session lifecycle manager.
//!
//! Owns the one authoritative session and drives the login / MFA state
//! machine:
//!
//! ```text
//! Unauthenticated --login--> Authenticated | AwaitingMfa
//! AwaitingMfa --mfa ok--> Authenticated
//! AwaitingMfa --mfa rejected--> AwaitingMfa (attempts + 1)
//! AwaitingMfa --abort / stale--> Unauthenticated
//! Authenticated --auth error--> Degraded --login--> Authenticated
//! ```
//!
//! State lives behind a `RwLock`: `get_valid_session` only takes the read
//! side, transitions take the write side. Interactive flows (login, MFA,
//! restore) are additionally serialized by `auth_flow`, and no remote call is
//! made while the write guard is held.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, LoginResponse, RemoteClient};
use crate::auth::{totp, Credentials, PersistedSession, Session, SessionStore};
use crate::error::{BridgeError, BridgeResult};

/// How long an MFA challenge stays answerable.
const MFA_CHALLENGE_TTL_MINUTES: i64 = 10;

/// Rejected codes allowed per challenge before it is dropped.
pub const MAX_MFA_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    AwaitingMfa,
    Authenticated,
    /// Was authenticated; the remote has since rejected the session.
    Degraded,
}

/// Result of a password login. A challenge is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated,
    MfaRequired { challenge_id: String },
}

/// Snapshot of the manager for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: AuthState,
    pub logged_in: bool,
    pub session_created_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub mfa_attempts: Option<u32>,
    pub auto_login_blocked: bool,
    pub restore_pending: bool,
}

struct PendingAuth {
    challenge_id: String,
    challenged_at: DateTime<Utc>,
    attempts: u32,
    credentials: Credentials,
}

struct Inner {
    state: AuthState,
    session: Option<Arc<Session>>,
    last_activity: Option<DateTime<Utc>>,
    pending: Option<PendingAuth>,
    /// Set when the configured credentials were rejected, or when they hit
    /// an MFA challenge no configured secret can answer. Cleared by any
    /// successful login.
    auto_login_blocked: bool,
    /// A persisted record exists that could not be probed yet.
    unverified_record: bool,
}

enum CallFailure {
    Timeout,
    Api(ApiError),
}

pub struct SessionManager {
    remote: Arc<dyn RemoteClient>,
    store: SessionStore,
    credentials: Option<Credentials>,
    timeout: Duration,
    mfa_ttl: TimeDelta,
    inner: RwLock<Inner>,
    auth_flow: Mutex<()>,
    next_session_id: AtomicU64,
    invalidated: Notify,
}

impl SessionManager {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: SessionStore,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Self {
        Self {
            remote,
            store,
            credentials,
            timeout,
            mfa_ttl: TimeDelta::minutes(MFA_CHALLENGE_TTL_MINUTES),
            inner: RwLock::new(Inner {
                state: AuthState::Unauthenticated,
                session: None,
                last_activity: None,
                pending: None,
                auto_login_blocked: false,
                unverified_record: false,
            }),
            auth_flow: Mutex::new(()),
            next_session_id: AtomicU64::new(1),
            invalidated: Notify::new(),
        }
    }

    pub fn with_mfa_ttl(mut self, ttl: TimeDelta) -> Self {
        self.mfa_ttl = ttl;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub async fn state(&self) -> AuthState {
        self.inner.read().await.state
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.read().await;
        SessionStatus {
            state: inner.state,
            logged_in: inner.state == AuthState::Authenticated,
            session_created_at: inner.session.as_ref().map(|s| s.created_at()),
            last_activity: inner.last_activity,
            mfa_attempts: inner.pending.as_ref().map(|p| p.attempts),
            auto_login_blocked: inner.auto_login_blocked,
            restore_pending: inner.unverified_record,
        }
    }

    /// Completes when a session is invalidated. Used to wake the keep-alive
    /// loop for an early re-login attempt.
    pub async fn invalidated(&self) {
        self.invalidated.notified().await
    }

    // ===== Authentication =====

    /// Password login. Discards any pending MFA challenge before contacting
    /// the remote, so a code for an older challenge can never complete.
    pub async fn login(&self, credentials: &Credentials) -> BridgeResult<LoginOutcome> {
        let _flow = self.auth_flow.lock().await;

        {
            let mut inner = self.inner.write().await;
            if inner.pending.take().is_some() {
                debug!("Discarding superseded MFA challenge");
                if inner.state == AuthState::AwaitingMfa {
                    inner.state = AuthState::Unauthenticated;
                }
            }
        }

        info!("Logging in to remote service");
        let response = self
            .bounded(self.remote.login(&credentials.email, &credentials.password))
            .await
            .map_err(login_failure)?;

        match response {
            LoginResponse::Token(token) => {
                self.establish(token).await?;
                Ok(LoginOutcome::Authenticated)
            }
            LoginResponse::MfaRequired => {
                let challenge_id = new_challenge_id();
                let mut inner = self.inner.write().await;
                if inner.session.take().is_some() {
                    self.clear_store("re-login challenged");
                }
                inner.last_activity = None;
                inner.pending = Some(PendingAuth {
                    challenge_id: challenge_id.clone(),
                    challenged_at: Utc::now(),
                    attempts: 0,
                    credentials: credentials.clone(),
                });
                inner.state = AuthState::AwaitingMfa;
                info!("MFA challenge issued");
                Ok(LoginOutcome::MfaRequired { challenge_id })
            }
        }
    }

    /// Answer the pending MFA challenge. When `challenge_id` is given it must
    /// name the latest challenge.
    pub async fn submit_mfa_code(
        &self,
        code: &str,
        challenge_id: Option<&str>,
    ) -> BridgeResult<()> {
        let _flow = self.auth_flow.lock().await;

        let credentials = {
            let mut inner = self.inner.write().await;
            if inner.state != AuthState::AwaitingMfa {
                return Err(BridgeError::NoPendingChallenge);
            }
            let stale = match inner.pending {
                Some(ref pending) => Utc::now() - pending.challenged_at >= self.mfa_ttl,
                None => return Err(BridgeError::NoPendingChallenge),
            };
            if stale {
                warn!("MFA challenge expired before a code was submitted");
                inner.pending = None;
                inner.state = AuthState::Unauthenticated;
                return Err(BridgeError::NoPendingChallenge);
            }
            let Some(pending) = inner.pending.as_ref() else {
                return Err(BridgeError::NoPendingChallenge);
            };
            if let Some(id) = challenge_id {
                if id != pending.challenge_id {
                    warn!("MFA code submitted for a superseded challenge");
                    return Err(BridgeError::InvalidMfaCode);
                }
            }
            if code.trim().is_empty() {
                return Err(BridgeError::InvalidMfaCode);
            }
            pending.credentials.clone()
        };

        let result = self
            .bounded(self.remote.login_mfa(
                &credentials.email,
                &credentials.password,
                code.trim(),
            ))
            .await
            .map_err(login_failure);

        match result {
            Ok(token) => {
                self.establish(token).await?;
                Ok(())
            }
            Err(BridgeError::InvalidMfaCode) => {
                let mut inner = self.inner.write().await;
                let exhausted = match inner.pending.as_mut() {
                    Some(pending) => {
                        pending.attempts += 1;
                        warn!(attempts = pending.attempts, "MFA code rejected");
                        pending.attempts >= MAX_MFA_ATTEMPTS
                    }
                    None => false,
                };
                if exhausted {
                    warn!("Too many rejected MFA codes; challenge discarded");
                    inner.pending = None;
                    inner.state = AuthState::Unauthenticated;
                }
                Err(BridgeError::InvalidMfaCode)
            }
            Err(BridgeError::AuthRejected(msg)) => {
                let mut inner = self.inner.write().await;
                inner.pending = None;
                inner.state = AuthState::Unauthenticated;
                Err(BridgeError::AuthRejected(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the pending MFA challenge.
    pub async fn abort_mfa(&self) -> BridgeResult<()> {
        let _flow = self.auth_flow.lock().await;
        let mut inner = self.inner.write().await;
        if inner.pending.take().is_none() {
            return Err(BridgeError::NoPendingChallenge);
        }
        inner.state = AuthState::Unauthenticated;
        info!("MFA challenge aborted");
        Ok(())
    }

    /// Discard a challenge that has outlived its TTL. Returns true if one was
    /// dropped.
    pub async fn expire_stale_challenge(&self) -> bool {
        let mut inner = self.inner.write().await;
        let stale = inner
            .pending
            .as_ref()
            .map(|p| Utc::now() - p.challenged_at >= self.mfa_ttl)
            .unwrap_or(false);
        if stale {
            inner.pending = None;
            if inner.state == AuthState::AwaitingMfa {
                inner.state = AuthState::Unauthenticated;
            }
            info!("Stale MFA challenge discarded");
        }
        stale
    }

    /// Whether the keep-alive loop may try the configured credentials.
    pub async fn can_auto_login(&self) -> bool {
        self.credentials.is_some() && !self.inner.read().await.auto_login_blocked
    }

    /// Log in with the configured credentials, answering an MFA challenge
    /// with a TOTP code when a secret is configured.
    pub async fn auto_login(&self) -> BridgeResult<LoginOutcome> {
        let Some(credentials) = self.credentials.clone() else {
            return Err(BridgeError::AuthRejected(
                "no credentials configured".to_string(),
            ));
        };
        if self.inner.read().await.auto_login_blocked {
            return Err(BridgeError::AuthRejected(
                "automatic login paused until a manual login succeeds".to_string(),
            ));
        }

        info!("Attempting automatic login");
        let outcome = match self.login(&credentials).await {
            Ok(outcome) => outcome,
            Err(BridgeError::AuthRejected(msg)) => {
                error!("Configured credentials were rejected; automatic login disabled");
                self.inner.write().await.auto_login_blocked = true;
                return Err(BridgeError::AuthRejected(msg));
            }
            Err(e) => return Err(e),
        };

        let LoginOutcome::MfaRequired { challenge_id } = outcome else {
            info!("Automatic login successful");
            return Ok(LoginOutcome::Authenticated);
        };

        let Some(ref secret) = credentials.mfa_secret else {
            // Each unattended login sends the user a fresh code, so only retry
            // once someone has answered a challenge by hand.
            warn!("MFA required but MONARCH_MFA_SECRET is not set; submit the code via POST /auth/mfa");
            self.inner.write().await.auto_login_blocked = true;
            return Ok(LoginOutcome::MfaRequired { challenge_id });
        };

        let code = match totp::generate_code(secret, Utc::now().timestamp()) {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Configured MFA secret is unusable; automatic login disabled");
                self.inner.write().await.auto_login_blocked = true;
                return Err(BridgeError::AuthRejected(e.to_string()));
            }
        };

        self.submit_mfa_code(&code, Some(&challenge_id)).await?;
        info!("Automatic login with TOTP successful");
        Ok(LoginOutcome::Authenticated)
    }

    // ===== Session access =====

    /// The single choke-point for using the session.
    pub async fn get_valid_session(&self) -> BridgeResult<Arc<Session>> {
        let inner = self.inner.read().await;
        match (inner.state, inner.session.as_ref()) {
            (AuthState::Authenticated, Some(session)) => Ok(Arc::clone(session)),
            _ => Err(BridgeError::SessionExpired),
        }
    }

    /// `Authenticated -> Degraded`. Returns true if a transition happened.
    pub async fn invalidate(&self, reason: &str) -> bool {
        let mut inner = self.inner.write().await;
        self.degrade(&mut inner, reason)
    }

    /// Like `invalidate`, but only if `session` is still the current one. A
    /// caller holding an older session cannot knock out a newer login.
    pub async fn invalidate_session(&self, session: &Session, reason: &str) -> bool {
        let mut inner = self.inner.write().await;
        let current = inner
            .session
            .as_ref()
            .map(|s| s.id() == session.id())
            .unwrap_or(false);
        if !current {
            debug!(session_id = session.id(), "Ignoring invalidation for a replaced session");
            return false;
        }
        self.degrade(&mut inner, reason)
    }

    /// Record a successful remote call made with `session`.
    pub async fn record_activity(&self, session: &Session) {
        let mut inner = self.inner.write().await;
        let current = inner
            .session
            .as_ref()
            .map(|s| s.id() == session.id())
            .unwrap_or(false);
        if current {
            inner.last_activity = Some(Utc::now());
        }
    }

    /// Run a remote operation with the current session, bounded by the
    /// request timeout. An auth error invalidates that session and surfaces
    /// as `SessionExpired`; there is no retry.
    pub async fn with_session<T, F, Fut>(&self, op: F) -> BridgeResult<T>
    where
        F: FnOnce(Arc<dyn RemoteClient>, Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let session = self.get_valid_session().await?;
        self.call_with_session(session, op).await
    }

    /// Like `with_session`, for a caller already holding `session`. An auth
    /// error only degrades the manager if `session` is still current.
    pub async fn call_with_session<T, F, Fut>(
        &self,
        session: Arc<Session>,
        op: F,
    ) -> BridgeResult<T>
    where
        F: FnOnce(Arc<dyn RemoteClient>, Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match self
            .bounded(op(Arc::clone(&self.remote), Arc::clone(&session)))
            .await
        {
            Ok(value) => {
                self.record_activity(&session).await;
                Ok(value)
            }
            Err(CallFailure::Api(e)) if e.is_auth_error() => {
                self.invalidate_session(&session, "remote rejected session")
                    .await;
                Err(BridgeError::SessionExpired)
            }
            Err(CallFailure::Api(e)) => Err(e.into()),
            Err(CallFailure::Timeout) => Err(self.timeout_error()),
        }
    }

    // ===== Persistence =====

    /// Write the current session to the store. A no-op when not
    /// authenticated.
    pub async fn save(&self) -> BridgeResult<()> {
        let inner = self.inner.read().await;
        let (AuthState::Authenticated, Some(session)) = (inner.state, inner.session.as_ref())
        else {
            return Ok(());
        };
        let record = PersistedSession {
            token: session.token().to_string(),
            created_at: session.created_at(),
            last_activity: inner.last_activity.unwrap_or_else(Utc::now),
        };
        self.store
            .save(&record)
            .map_err(|e| BridgeError::Storage(format!("{:#}", e)))
    }

    /// Whether a persisted record is waiting for a successful probe.
    pub async fn has_unverified_record(&self) -> bool {
        self.inner.read().await.unverified_record
    }

    /// Load and probe the persisted session. Only a record the remote accepts
    /// is adopted. One that could not be probed (outage, timeout) stays on
    /// disk for a later `restore`, and the manager stays unauthenticated.
    pub async fn restore(&self) -> bool {
        let _flow = self.auth_flow.lock().await;
        {
            let mut inner = self.inner.write().await;
            if inner.state == AuthState::Authenticated {
                return true;
            }
            inner.unverified_record = false;
        }

        let record = match self.store.load() {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(path = ?self.store.path(), "No persisted session");
                return false;
            }
            Err(e) => {
                warn!(error = %e, path = ?self.store.path(), "Persisted session is unreadable; discarding");
                self.clear_store("unreadable record");
                return false;
            }
        };

        match self.bounded(self.remote.keep_alive_ping(&record.token)).await {
            Ok(()) => {}
            Err(CallFailure::Api(e)) if e.is_transient() => {
                warn!(error = %e, "Could not verify persisted session; will retry");
                self.inner.write().await.unverified_record = true;
                return false;
            }
            Err(CallFailure::Timeout) => {
                warn!("Timed out verifying persisted session; will retry");
                self.inner.write().await.unverified_record = true;
                return false;
            }
            Err(CallFailure::Api(e)) => {
                info!(error = %e, "Persisted session was rejected by the remote; discarding");
                self.clear_store("restored session rejected");
                return false;
            }
        }

        let session = Arc::new(Session::new(
            self.next_session_id.fetch_add(1, Ordering::SeqCst),
            record.token,
            record.created_at,
        ));
        let mut inner = self.inner.write().await;
        info!(session_id = session.id(), "Session restored from disk");
        inner.session = Some(session);
        inner.last_activity = Some(Utc::now());
        inner.pending = None;
        inner.state = AuthState::Authenticated;
        inner.unverified_record = false;
        true
    }

    /// Restore, then fall back to automatic login if credentials are
    /// configured. A record that could not be probed is left for the
    /// keep-alive loop to retry instead. Failures are logged, never fatal.
    pub async fn startup(&self) -> AuthState {
        if self.restore().await {
            return self.state().await;
        }
        if self.has_unverified_record().await {
            info!("Persisted session unverified; keep-alive will retry restore");
            return self.state().await;
        }

        if self.credentials.is_some() {
            match self.auto_login().await {
                Ok(LoginOutcome::Authenticated) => {}
                Ok(LoginOutcome::MfaRequired { .. }) => {
                    info!("Automatic login is waiting for an MFA code")
                }
                Err(e) => error!(error = %e, "Automatic login failed"),
            }
        } else {
            info!("No credentials configured; waiting for manual login");
        }
        self.state().await
    }

    /// Persist the final activity timestamp.
    pub async fn shutdown(&self) {
        if let Err(e) = self.save().await {
            warn!(error = %e, "Failed to save session on shutdown");
        }
    }

    // ===== Internals =====

    /// Install a fresh session. Persisted before the state flips, so nobody
    /// sees `Authenticated` without a matching record on disk.
    async fn establish(&self, token: String) -> BridgeResult<Arc<Session>> {
        let now = Utc::now();
        let session = Arc::new(Session::new(
            self.next_session_id.fetch_add(1, Ordering::SeqCst),
            token,
            now,
        ));
        let record = PersistedSession {
            token: session.token().to_string(),
            created_at: now,
            last_activity: now,
        };

        let mut inner = self.inner.write().await;
        inner.pending = None;
        if let Err(e) = self.store.save(&record) {
            error!(error = %e, path = ?self.store.path(), "Failed to persist session");
            if inner.state == AuthState::AwaitingMfa {
                inner.state = AuthState::Unauthenticated;
            }
            return Err(BridgeError::Storage(format!("{:#}", e)));
        }

        inner.session = Some(Arc::clone(&session));
        inner.last_activity = Some(now);
        inner.state = AuthState::Authenticated;
        inner.auto_login_blocked = false;
        inner.unverified_record = false;
        info!(session_id = session.id(), path = ?self.store.path(), "Session established and saved");
        Ok(session)
    }

    fn degrade(&self, inner: &mut Inner, reason: &str) -> bool {
        if inner.state != AuthState::Authenticated {
            return false;
        }
        let session_id = inner.session.as_ref().map(|s| s.id());
        inner.state = AuthState::Degraded;
        inner.session = None;
        inner.unverified_record = false;
        self.clear_store(reason);
        warn!(?session_id, reason, "Session invalidated");
        self.invalidated.notify_one();
        true
    }

    fn clear_store(&self, reason: &str) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, reason, "Failed to remove session file");
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, CallFailure>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CallFailure::Api(e)),
            Err(_) => Err(CallFailure::Timeout),
        }
    }

    fn timeout_error(&self) -> BridgeError {
        BridgeError::RemoteUnavailable(format!(
            "no response within {}s",
            self.timeout.as_secs_f32()
        ))
    }
}

/// Map adapter failures during login/MFA to caller-facing errors.
fn login_failure(failure: CallFailure) -> BridgeError {
    match failure {
        CallFailure::Timeout => BridgeError::LoginTimeout,
        CallFailure::Api(ApiError::Unauthorized) => {
            BridgeError::AuthRejected("credentials rejected".to_string())
        }
        CallFailure::Api(e) => e.into(),
    }
}

fn new_challenge_id() -> String {
    use rand::Rng;
    let value: u64 = rand::thread_rng().gen();
    format!("{:016x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRemote;

    const EMAIL: &str = "me@example.com";
    const PASSWORD: &str = "correct horse";

    struct Fixture {
        _dir: tempfile::TempDir,
        remote: Arc<MockRemote>,
        store: SessionStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = SessionStore::new(dir.path().join("session.json"));
            Self {
                _dir: dir,
                remote: Arc::new(MockRemote::new(EMAIL, PASSWORD)),
                store,
            }
        }

        fn manager(&self, credentials: Option<Credentials>) -> SessionManager {
            SessionManager::new(
                self.remote.clone(),
                self.store.clone(),
                credentials,
                Duration::from_millis(200),
            )
        }
    }

    fn creds() -> Credentials {
        Credentials::new(EMAIL, PASSWORD)
    }

    #[tokio::test]
    async fn test_login_without_mfa_persists_session() {
        let fx = Fixture::new();
        let manager = fx.manager(None);

        let outcome = manager.login(&creds()).await.unwrap();
        assert_eq!(outcome, LoginOutcome::Authenticated);
        assert_eq!(manager.state().await, AuthState::Authenticated);
        assert!(fx.store.exists());
        let record = fx.store.load().unwrap().unwrap();
        let session = manager.get_valid_session().await.unwrap();
        assert_eq!(record.token, session.token());
    }

    #[tokio::test]
    async fn test_bad_credentials_rejected() {
        let fx = Fixture::new();
        let manager = fx.manager(None);

        let err = manager
            .login(&Credentials::new(EMAIL, "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::AuthRejected(_)));
        assert_eq!(manager.state().await, AuthState::Unauthenticated);
        assert!(!fx.store.exists());
    }

    #[tokio::test]
    async fn test_mfa_flow() {
        let fx = Fixture::new();
        fx.remote.require_mfa(true);
        fx.remote.accept_codes(&["123456"]);
        let manager = fx.manager(None);

        let outcome = manager.login(&creds()).await.unwrap();
        let LoginOutcome::MfaRequired { challenge_id } = outcome else {
            panic!("expected MFA challenge");
        };
        assert_eq!(manager.state().await, AuthState::AwaitingMfa);
        assert!(matches!(
            manager.get_valid_session().await,
            Err(BridgeError::SessionExpired)
        ));

        let err = manager
            .submit_mfa_code("000000", Some(&challenge_id))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::InvalidMfaCode);
        assert_eq!(manager.state().await, AuthState::AwaitingMfa);
        assert_eq!(manager.status().await.mfa_attempts, Some(1));

        manager
            .submit_mfa_code("123456", Some(&challenge_id))
            .await
            .unwrap();
        assert_eq!(manager.state().await, AuthState::Authenticated);
        assert!(fx.store.exists());
        assert_eq!(manager.status().await.mfa_attempts, None);
    }

    #[tokio::test]
    async fn test_mfa_without_challenge() {
        let fx = Fixture::new();
        let manager = fx.manager(None);
        assert_eq!(
            manager.submit_mfa_code("123456", None).await,
            Err(BridgeError::NoPendingChallenge)
        );

        manager.login(&creds()).await.unwrap();
        assert_eq!(
            manager.submit_mfa_code("123456", None).await,
            Err(BridgeError::NoPendingChallenge)
        );
    }

    #[tokio::test]
    async fn test_superseded_challenge_cannot_complete() {
        let fx = Fixture::new();
        fx.remote.require_mfa(true);
        fx.remote.accept_codes(&["123456"]);
        let manager = fx.manager(None);

        let LoginOutcome::MfaRequired { challenge_id: first } =
            manager.login(&creds()).await.unwrap()
        else {
            panic!("expected MFA challenge");
        };
        let LoginOutcome::MfaRequired { challenge_id: second } =
            manager.login(&creds()).await.unwrap()
        else {
            panic!("expected MFA challenge");
        };
        assert_ne!(first, second);

        // Valid code, but against the old challenge.
        assert_eq!(
            manager.submit_mfa_code("123456", Some(&first)).await,
            Err(BridgeError::InvalidMfaCode)
        );
        assert_eq!(manager.state().await, AuthState::AwaitingMfa);

        manager
            .submit_mfa_code("123456", Some(&second))
            .await
            .unwrap();
        assert_eq!(manager.state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_stale_challenge() {
        let fx = Fixture::new();
        fx.remote.require_mfa(true);
        fx.remote.accept_codes(&["123456"]);
        let manager = fx.manager(None).with_mfa_ttl(TimeDelta::zero());

        manager.login(&creds()).await.unwrap();
        assert_eq!(
            manager.submit_mfa_code("123456", None).await,
            Err(BridgeError::NoPendingChallenge)
        );
        assert_eq!(manager.state().await, AuthState::Unauthenticated);
        assert_eq!(fx.remote.mfa_calls(), 0);
    }

    #[tokio::test]
    async fn test_too_many_mfa_attempts_drop_challenge() {
        let fx = Fixture::new();
        fx.remote.require_mfa(true);
        let manager = fx.manager(None);

        manager.login(&creds()).await.unwrap();
        for _ in 0..MAX_MFA_ATTEMPTS {
            assert_eq!(
                manager.submit_mfa_code("999999", None).await,
                Err(BridgeError::InvalidMfaCode)
            );
        }
        assert_eq!(manager.state().await, AuthState::Unauthenticated);
        assert_eq!(
            manager.submit_mfa_code("999999", None).await,
            Err(BridgeError::NoPendingChallenge)
        );
    }

    #[tokio::test]
    async fn test_abort_mfa() {
        let fx = Fixture::new();
        fx.remote.require_mfa(true);
        let manager = fx.manager(None);

        assert_eq!(manager.abort_mfa().await, Err(BridgeError::NoPendingChallenge));
        manager.login(&creds()).await.unwrap();
        manager.abort_mfa().await.unwrap();
        assert_eq!(manager.state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_invalidate_degrades_once() {
        let fx = Fixture::new();
        let manager = fx.manager(None);
        manager.login(&creds()).await.unwrap();

        assert!(manager.invalidate("test").await);
        assert!(!manager.invalidate("test").await);
        assert_eq!(manager.state().await, AuthState::Degraded);
        assert!(!fx.store.exists());
        assert_eq!(
            manager.get_valid_session().await,
            Err(BridgeError::SessionExpired)
        );

        manager.login(&creds()).await.unwrap();
        assert_eq!(manager.state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_stale_session_cannot_invalidate_newer_one() {
        let fx = Fixture::new();
        let manager = fx.manager(None);
        manager.login(&creds()).await.unwrap();
        let old = manager.get_valid_session().await.unwrap();

        manager.login(&creds()).await.unwrap();
        let new = manager.get_valid_session().await.unwrap();
        assert_ne!(old.id(), new.id());

        assert!(!manager.invalidate_session(&old, "late failure").await);
        assert_eq!(manager.state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_concurrent_get_valid_session_same_identity() {
        let fx = Fixture::new();
        let manager = Arc::new(fx.manager(None));
        manager.login(&creds()).await.unwrap();

        let tasks = (0..32).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_valid_session().await.unwrap().id() })
        });
        let ids: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_restore_valid_record_without_login() {
        let fx = Fixture::new();
        {
            let manager = fx.manager(None);
            manager.login(&creds()).await.unwrap();
        }
        let logins = fx.remote.login_calls();

        let manager = fx.manager(None);
        assert_eq!(manager.startup().await, AuthState::Authenticated);
        assert_eq!(fx.remote.login_calls(), logins);
        assert!(manager.restore().await);
    }

    #[tokio::test]
    async fn test_restore_missing_or_corrupt_record() {
        let fx = Fixture::new();
        let manager = fx.manager(None);
        assert_eq!(manager.startup().await, AuthState::Unauthenticated);

        std::fs::write(fx.store.path(), "not json").unwrap();
        let manager = fx.manager(None);
        assert_eq!(manager.startup().await, AuthState::Unauthenticated);
        assert!(!fx.store.exists());
    }

    #[tokio::test]
    async fn test_restore_rejected_record_falls_back_to_auto_login() {
        let fx = Fixture::new();
        let now = Utc::now();
        fx.store
            .save(&PersistedSession {
                token: "revoked".to_string(),
                created_at: now,
                last_activity: now,
            })
            .unwrap();

        let manager = fx.manager(Some(creds()));
        assert_eq!(manager.startup().await, AuthState::Authenticated);
        assert_eq!(fx.remote.login_calls(), 1);
        assert_ne!(fx.store.load().unwrap().unwrap().token, "revoked");
    }

    #[tokio::test]
    async fn test_auto_login_resolves_mfa_with_totp() {
        let fx = Fixture::new();
        let secret = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";
        fx.remote.require_mfa(true);
        fx.remote.accept_totp(secret);
        let manager = fx.manager(Some(creds().with_mfa_secret(secret)));

        assert_eq!(manager.startup().await, AuthState::Authenticated);
        assert!(fx.store.exists());
    }

    #[tokio::test]
    async fn test_auto_login_without_secret_waits_for_code() {
        let fx = Fixture::new();
        fx.remote.require_mfa(true);
        fx.remote.accept_codes(&["246810"]);
        let manager = fx.manager(Some(creds()));

        assert_eq!(manager.startup().await, AuthState::AwaitingMfa);
        // Another unattended login would only send the user a new code.
        assert!(!manager.can_auto_login().await);

        manager.submit_mfa_code("246810", None).await.unwrap();
        assert!(manager.can_auto_login().await);
        assert_eq!(fx.remote.login_calls(), 1);
    }

    #[tokio::test]
    async fn test_restore_unverifiable_record_is_not_adopted() {
        let fx = Fixture::new();
        {
            let manager = fx.manager(None);
            manager.login(&creds()).await.unwrap();
        }
        fx.remote.set_offline(true);

        let manager = fx.manager(Some(creds()));
        assert_eq!(manager.startup().await, AuthState::Unauthenticated);
        let status = manager.status().await;
        assert!(!status.logged_in);
        assert!(status.restore_pending);
        assert_eq!(
            manager.get_valid_session().await,
            Err(BridgeError::SessionExpired)
        );
        // Record kept, no fallback login while the remote is down.
        assert!(fx.store.exists());
        assert_eq!(fx.remote.login_calls(), 1);

        fx.remote.set_offline(false);
        assert!(manager.restore().await);
        assert_eq!(manager.state().await, AuthState::Authenticated);
        assert!(!manager.has_unverified_record().await);
        assert_eq!(fx.remote.login_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_auto_login_is_not_retried() {
        let fx = Fixture::new();
        let manager = fx.manager(Some(Credentials::new(EMAIL, "stale password")));

        assert_eq!(manager.startup().await, AuthState::Unauthenticated);
        assert!(!manager.can_auto_login().await);
        assert!(manager.auto_login().await.is_err());
        assert_eq!(fx.remote.login_calls(), 1);

        // A manual login with good credentials lifts the block.
        manager.login(&creds()).await.unwrap();
        assert!(manager.can_auto_login().await);
    }

    #[tokio::test]
    async fn test_login_timeout_is_distinct() {
        let fx = Fixture::new();
        fx.remote.set_delay(Some(Duration::from_secs(5)));
        let manager = fx.manager(None);

        assert_eq!(
            manager.login(&creds()).await,
            Err(BridgeError::LoginTimeout)
        );
        assert_eq!(manager.state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_storage_failure_blocks_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        // Parent path is a file, so the session directory cannot be created.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let remote = Arc::new(MockRemote::new(EMAIL, PASSWORD));
        let manager = SessionManager::new(
            remote,
            SessionStore::new(blocker.join("session.json")),
            None,
            Duration::from_millis(200),
        );

        assert!(matches!(
            manager.login(&creds()).await,
            Err(BridgeError::Storage(_))
        ));
        assert_eq!(manager.state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_with_session_auth_error_invalidates() {
        let fx = Fixture::new();
        let manager = fx.manager(None);
        manager.login(&creds()).await.unwrap();
        fx.remote.revoke_tokens();

        let result = manager
            .with_session(|remote, session| async move {
                remote.keep_alive_ping(session.token()).await
            })
            .await;
        assert_eq!(result, Err(BridgeError::SessionExpired));
        assert_eq!(manager.state().await, AuthState::Degraded);
    }

    #[tokio::test]
    async fn test_call_with_replaced_session_keeps_newer_login() {
        let fx = Fixture::new();
        let manager = fx.manager(None);
        manager.login(&creds()).await.unwrap();
        let old = manager.get_valid_session().await.unwrap();
        fx.remote.revoke_tokens();
        manager.login(&creds()).await.unwrap();

        let result = manager
            .call_with_session(old, |remote, session| async move {
                remote.keep_alive_ping(session.token()).await
            })
            .await;
        assert_eq!(result, Err(BridgeError::SessionExpired));
        assert_eq!(manager.state().await, AuthState::Authenticated);
        assert!(manager.get_valid_session().await.is_ok());
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let fx = Fixture::new();
        let manager = fx.manager(None);
        manager.save().await.unwrap();
        assert!(!fx.store.exists());

        manager.login(&creds()).await.unwrap();
        manager.save().await.unwrap();
        manager.save().await.unwrap();
        assert!(fx.store.exists());
    }
}
