//! Transaction proxy.
//!
//! Translates read/update requests into remote calls made through the
//! session manager, so every call runs against a checked session and auth
//! failures degrade the session for the next caller.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::{debug, info};

use crate::error::{BridgeError, BridgeResult};
use crate::lifecycle::SessionManager;
use crate::models::{Transaction, TransactionUpdate};

/// Longest lookback accepted by `list_transactions`.
pub const MAX_LOOKBACK_DAYS: i64 = 3650;

/// Page size for transaction fetches.
const TRANSACTION_FETCH_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResult {
    Updated(Transaction),
    /// The update carried no fields; nothing was sent.
    NoChange,
}

#[derive(Clone)]
pub struct TransactionProxy {
    manager: Arc<SessionManager>,
}

impl TransactionProxy {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Transactions dated within the last `since_days` days, newest first as
    /// the remote orders them.
    pub async fn list_transactions(&self, since_days: i64) -> BridgeResult<Vec<Transaction>> {
        if !(1..=MAX_LOOKBACK_DAYS).contains(&since_days) {
            return Err(BridgeError::ValidationError(format!(
                "days must be between 1 and {}",
                MAX_LOOKBACK_DAYS
            )));
        }

        let end = Utc::now().date_naive();
        let start = end - TimeDelta::days(since_days);

        let transactions = self
            .manager
            .with_session(move |remote, session| async move {
                remote
                    .get_transactions(session.token(), start, end, TRANSACTION_FETCH_LIMIT)
                    .await
            })
            .await?;

        debug!(count = transactions.len(), since_days, "Fetched transactions");
        Ok(transactions)
    }

    pub async fn update_transaction(
        &self,
        id: &str,
        update: TransactionUpdate,
    ) -> BridgeResult<UpdateResult> {
        self.manager.get_valid_session().await?;

        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(BridgeError::ValidationError(
                "transaction id must not be empty".to_string(),
            ));
        }
        update.validate()?;
        if update.is_empty() {
            return Ok(UpdateResult::NoChange);
        }

        let txn_id = id.clone();
        let updated = self
            .manager
            .with_session(move |remote, session| async move {
                remote
                    .update_transaction(session.token(), &txn_id, &update)
                    .await
            })
            .await?;

        info!(transaction_id = %id, "Transaction updated");
        Ok(UpdateResult::Updated(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::auth::{Credentials, SessionStore};
    use crate::lifecycle::AuthState;
    use crate::testing::MockRemote;

    const EMAIL: &str = "me@example.com";
    const PASSWORD: &str = "pw";

    fn txn(id: &str, days_ago: i64) -> Transaction {
        Transaction {
            id: id.to_string(),
            date: Some(
                (Utc::now().date_naive() - TimeDelta::days(days_ago))
                    .format("%Y-%m-%d")
                    .to_string(),
            ),
            amount: Some(-10.0),
            merchant_name: Some("Market".to_string()),
            category_id: Some("cat-1".to_string()),
            category_name: Some("Groceries".to_string()),
            account_name: None,
            notes: None,
            needs_review: true,
            pending: false,
        }
    }

    async fn setup() -> (
        tempfile::TempDir,
        Arc<MockRemote>,
        Arc<SessionManager>,
        TransactionProxy,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MockRemote::new(EMAIL, PASSWORD));
        remote.set_transactions(vec![txn("abc", 1), txn("def", 10), txn("old", 400)]);
        let manager = Arc::new(SessionManager::new(
            remote.clone(),
            SessionStore::new(dir.path().join("session.json")),
            None,
            Duration::from_millis(200),
        ));
        manager
            .login(&Credentials::new(EMAIL, PASSWORD))
            .await
            .unwrap();
        let proxy = TransactionProxy::new(manager.clone());
        (dir, remote, manager, proxy)
    }

    #[tokio::test]
    async fn test_list_transactions_window() {
        let (_dir, _remote, _manager, proxy) = setup().await;
        let txns = proxy.list_transactions(30).await.unwrap();
        let ids: Vec<&str> = txns.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["abc", "def"]);
    }

    #[tokio::test]
    async fn test_list_transactions_rejects_bad_days() {
        let (_dir, _remote, _manager, proxy) = setup().await;
        assert!(matches!(
            proxy.list_transactions(0).await,
            Err(BridgeError::ValidationError(_))
        ));
        assert!(matches!(
            proxy.list_transactions(MAX_LOOKBACK_DAYS + 1).await,
            Err(BridgeError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_auth_error_invalidates_and_fails_this_call() {
        let (_dir, remote, manager, proxy) = setup().await;
        remote.revoke_tokens();

        assert_eq!(
            proxy.list_transactions(30).await,
            Err(BridgeError::SessionExpired)
        );
        assert_eq!(manager.state().await, AuthState::Degraded);
        assert_eq!(
            proxy.list_transactions(30).await,
            Err(BridgeError::SessionExpired)
        );
    }

    #[tokio::test]
    async fn test_transient_error_keeps_session() {
        let (_dir, remote, manager, proxy) = setup().await;
        remote.set_offline(true);
        assert!(matches!(
            proxy.list_transactions(30).await,
            Err(BridgeError::RemoteUnavailable(_))
        ));
        assert_eq!(manager.state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_slow_remote_times_out_as_unavailable() {
        let (_dir, remote, manager, proxy) = setup().await;
        remote.set_delay(Some(Duration::from_secs(5)));
        assert!(matches!(
            proxy.list_transactions(30).await,
            Err(BridgeError::RemoteUnavailable(_))
        ));
        assert_eq!(manager.state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_update_partial_fields() {
        let (_dir, remote, _manager, proxy) = setup().await;
        let update = TransactionUpdate {
            notes: Some("groceries".to_string()),
            ..Default::default()
        };
        let UpdateResult::Updated(updated) =
            proxy.update_transaction("abc", update).await.unwrap()
        else {
            panic!("expected an update");
        };
        assert_eq!(updated.notes.as_deref(), Some("groceries"));
        assert_eq!(updated.category_id.as_deref(), Some("cat-1"));
        assert!(updated.needs_review);
        assert_eq!(remote.transactions()[0].notes.as_deref(), Some("groceries"));
    }

    #[tokio::test]
    async fn test_update_errors() {
        let (_dir, _remote, _manager, proxy) = setup().await;
        let notes = TransactionUpdate {
            notes: Some("x".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            proxy.update_transaction("missing", notes.clone()).await,
            Err(BridgeError::NotFound(_))
        ));
        assert!(matches!(
            proxy.update_transaction("  ", notes).await,
            Err(BridgeError::ValidationError(_))
        ));
        let bad_date = TransactionUpdate {
            date: Some("yesterday".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            proxy.update_transaction("abc", bad_date).await,
            Err(BridgeError::ValidationError(_))
        ));
        assert_eq!(
            proxy
                .update_transaction("abc", TransactionUpdate::default())
                .await,
            Ok(UpdateResult::NoChange)
        );
    }

    #[tokio::test]
    async fn test_update_while_degraded_is_session_expired() {
        let (_dir, _remote, manager, proxy) = setup().await;
        manager.invalidate("test").await;
        let update = TransactionUpdate {
            notes: Some("groceries".to_string()),
            ..Default::default()
        };
        assert_eq!(
            proxy.update_transaction("abc", update).await,
            Err(BridgeError::SessionExpired)
        );
    }
}
