//! Scripted in-memory `RemoteClient` for tests.
//!
//! Behaves like a tiny remote service: one account, issued tokens that stay
//! valid until revoked, an optional MFA step, and a transaction list that
//! updates apply to.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::api::{ApiError, LoginResponse, RemoteClient};
use crate::auth::totp;
use crate::models::{Transaction, TransactionUpdate};

#[derive(Default)]
struct MockState {
    require_mfa: bool,
    accepted_codes: HashSet<String>,
    totp_secret: Option<String>,
    valid_tokens: HashSet<String>,
    issued: u64,
    offline: bool,
    delay: Option<Duration>,
    transactions: Vec<Transaction>,
}

pub struct MockRemote {
    email: String,
    password: String,
    state: Mutex<MockState>,
    login_calls: AtomicUsize,
    mfa_calls: AtomicUsize,
    ping_calls: AtomicUsize,
}

impl MockRemote {
    pub fn new(email: &str, password: &str) -> Self {
        Self {
            email: email.to_string(),
            password: password.to_string(),
            state: Mutex::new(MockState::default()),
            login_calls: AtomicUsize::new(0),
            mfa_calls: AtomicUsize::new(0),
            ping_calls: AtomicUsize::new(0),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn require_mfa(&self, required: bool) {
        self.with_state(|s| s.require_mfa = required);
    }

    pub fn accept_codes(&self, codes: &[&str]) {
        self.with_state(|s| s.accepted_codes.extend(codes.iter().map(|c| c.to_string())));
    }

    /// Accept codes derived from `secret` for the current, previous and next
    /// time step.
    pub fn accept_totp(&self, secret: &str) {
        self.with_state(|s| s.totp_secret = Some(secret.to_string()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.offline = offline);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.delay = delay);
    }

    /// Make every issued token stale, as when the remote drops sessions.
    pub fn revoke_tokens(&self) {
        self.with_state(|s| s.valid_tokens.clear());
    }

    pub fn set_transactions(&self, transactions: Vec<Transaction>) {
        self.with_state(|s| s.transactions = transactions);
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.with_state(|s| s.transactions.clone())
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn mfa_calls(&self) -> usize {
        self.mfa_calls.load(Ordering::SeqCst)
    }

    pub fn ping_calls(&self) -> usize {
        self.ping_calls.load(Ordering::SeqCst)
    }

    async fn simulate_network(&self) -> Result<(), ApiError> {
        let (offline, delay) = self.with_state(|s| (s.offline, s.delay));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if offline {
            return Err(ApiError::ServerError("service unavailable".to_string()));
        }
        Ok(())
    }

    fn issue_token(&self) -> String {
        self.with_state(|s| {
            s.issued += 1;
            let token = format!("mock-token-{}", s.issued);
            s.valid_tokens.insert(token.clone());
            token
        })
    }

    fn check_token(&self, token: &str) -> Result<(), ApiError> {
        if self.with_state(|s| s.valid_tokens.contains(token)) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    fn check_password(&self, email: &str, password: &str) -> Result<(), ApiError> {
        if email == self.email && password == self.password {
            Ok(())
        } else {
            Err(ApiError::InvalidCredentials("Incorrect username or password".to_string()))
        }
    }

    fn code_accepted(&self, code: &str) -> bool {
        self.with_state(|s| {
            if s.accepted_codes.contains(code) {
                return true;
            }
            let Some(ref secret) = s.totp_secret else {
                return false;
            };
            let now = Utc::now().timestamp();
            [now - totp::TOTP_STEP_SECS, now, now + totp::TOTP_STEP_SECS]
                .iter()
                .filter_map(|t| totp::generate_code(secret, *t).ok())
                .any(|expected| expected == code)
        })
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await?;
        self.check_password(email, password)?;
        if self.with_state(|s| s.require_mfa) {
            return Ok(LoginResponse::MfaRequired);
        }
        Ok(LoginResponse::Token(self.issue_token()))
    }

    async fn login_mfa(
        &self,
        email: &str,
        password: &str,
        code: &str,
    ) -> Result<String, ApiError> {
        self.mfa_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await?;
        self.check_password(email, password)?;
        if !self.code_accepted(code) {
            return Err(ApiError::InvalidMfaCode);
        }
        Ok(self.issue_token())
    }

    async fn get_transactions(
        &self,
        token: &str,
        start: NaiveDate,
        end: NaiveDate,
        limit: u32,
    ) -> Result<Vec<Transaction>, ApiError> {
        self.simulate_network().await?;
        self.check_token(token)?;
        Ok(self.with_state(|s| {
            s.transactions
                .iter()
                .filter(|t| {
                    t.date
                        .as_deref()
                        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                        .map(|d| d >= start && d <= end)
                        .unwrap_or(true)
                })
                .take(limit as usize)
                .cloned()
                .collect()
        }))
    }

    async fn update_transaction(
        &self,
        token: &str,
        id: &str,
        update: &TransactionUpdate,
    ) -> Result<Transaction, ApiError> {
        self.simulate_network().await?;
        self.check_token(token)?;
        self.with_state(|s| match s.transactions.iter_mut().find(|t| t.id == id) {
            Some(txn) => {
                update.apply_to(txn);
                Ok(txn.clone())
            }
            None => Err(ApiError::NotFound(format!("transaction {}", id))),
        })
    }

    async fn keep_alive_ping(&self, token: &str) -> Result<(), ApiError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await?;
        self.check_token(token)
    }
}
