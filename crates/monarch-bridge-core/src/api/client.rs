//! Remote client for the Monarch Money web API.
//!
//! `RemoteClient` is the seam the lifecycle manager talks to; `MonarchClient`
//! is the reqwest-backed implementation. Only a fixed handful of operations is
//! issued and records are passed through with light reshaping.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::models::{Transaction, TransactionUpdate};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Browser user agent; the remote rejects obvious non-browser clients.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const TRANSACTIONS_QUERY: &str = r#"
query GetTransactionsList($offset: Int, $limit: Int, $filters: TransactionFilterInput) {
  allTransactions(filters: $filters) {
    totalCount
    results(offset: $offset, limit: $limit) {
      id
      amount
      date
      pending
      notes
      needsReview
      merchant { id name }
      category { id name }
      account { id displayName }
    }
  }
}"#;

const UPDATE_TRANSACTION_MUTATION: &str = r#"
mutation Web_TransactionDrawerUpdateTransaction($input: UpdateTransactionMutationInput!) {
  updateTransaction(input: $input) {
    transaction {
      id
      amount
      date
      pending
      notes
      needsReview
      merchant { id name }
      category { id name }
      account { id displayName }
    }
    errors {
      message
      fieldErrors { field messages }
    }
  }
}"#;

const PING_QUERY: &str = r#"
query GetAccounts {
  accounts { id }
}"#;

// ============================================================================
// Capability seam
// ============================================================================

/// Outcome of a password login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResponse {
    Token(String),
    MfaRequired,
}

/// Capabilities the bridge needs from the remote service.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError>;

    /// Complete a challenged login with a one-time code; returns the token.
    async fn login_mfa(&self, email: &str, password: &str, code: &str)
        -> Result<String, ApiError>;

    async fn get_transactions(
        &self,
        token: &str,
        start: NaiveDate,
        end: NaiveDate,
        limit: u32,
    ) -> Result<Vec<Transaction>, ApiError>;

    async fn update_transaction(
        &self,
        token: &str,
        id: &str,
        update: &TransactionUpdate,
    ) -> Result<Transaction, ApiError>;

    /// Cheap authenticated call that resets the remote inactivity timer.
    async fn keep_alive_ping(&self, token: &str) -> Result<(), ApiError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginBody {
    token: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountRef {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteTransaction {
    id: String,
    amount: Option<f64>,
    date: Option<String>,
    pending: Option<bool>,
    notes: Option<String>,
    needs_review: Option<bool>,
    merchant: Option<NamedRef>,
    category: Option<NamedRef>,
    account: Option<AccountRef>,
}

impl RemoteTransaction {
    fn into_transaction(self) -> Transaction {
        let (category_id, category_name) = match self.category {
            Some(c) => (c.id, c.name),
            None => (None, None),
        };
        Transaction {
            id: self.id,
            date: self.date,
            amount: self.amount,
            merchant_name: self.merchant.and_then(|m| m.name),
            category_id,
            category_name,
            account_name: self.account.and_then(|a| a.display_name),
            notes: self.notes,
            needs_review: self.needs_review.unwrap_or(false),
            pending: self.pending.unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TransactionsData {
    #[serde(rename = "allTransactions")]
    all_transactions: TransactionPage,
}

#[derive(Debug, Deserialize)]
struct TransactionPage {
    #[serde(default)]
    results: Vec<RemoteTransaction>,
}

#[derive(Debug, Deserialize)]
struct UpdateData {
    #[serde(rename = "updateTransaction")]
    update_transaction: UpdatePayload,
}

#[derive(Debug, Deserialize)]
struct UpdatePayload {
    transaction: Option<RemoteTransaction>,
    errors: Option<PayloadErrors>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PayloadErrors {
    One(PayloadError),
    Many(Vec<PayloadError>),
}

#[derive(Debug, Deserialize)]
struct PayloadError {
    message: Option<String>,
}

impl PayloadErrors {
    fn messages(&self) -> Vec<String> {
        let list: Vec<&PayloadError> = match self {
            PayloadErrors::One(e) => vec![e],
            PayloadErrors::Many(v) => v.iter().collect(),
        };
        list.into_iter().filter_map(|e| e.message.clone()).collect()
    }
}

// ============================================================================
// Client
// ============================================================================

/// Monarch API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct MonarchClient {
    client: Client,
    base_url: String,
}

impl MonarchClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert("Client-Platform", header::HeaderValue::from_static("web"));
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn login_url(&self) -> String {
        format!("{}/auth/login/", self.base_url)
    }

    fn graphql_url(&self) -> String {
        format!("{}/graphql", self.base_url)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            Self::check_response(response).await.map(Some)
        }
    }

    async fn post_login(&self, body: &Value) -> Result<reqwest::Response, ApiError> {
        let response = self
            .client
            .post(self.login_url())
            .json(body)
            .send()
            .await?;
        Ok(response)
    }

    async fn read_token(response: reqwest::Response) -> Result<String, ApiError> {
        let body: LoginBody = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("login body: {}", e)))?;
        Ok(body.token)
    }

    async fn graphql<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        operation: &str,
        query: &str,
        variables: Value,
    ) -> Result<T, ApiError> {
        let body = json!({
            "operationName": operation,
            "query": query,
            "variables": variables,
        });

        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        let response = loop {
            let response = self
                .client
                .post(self.graphql_url())
                .header(header::AUTHORIZATION, format!("Token {}", token))
                .json(&body)
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => break response,
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(operation, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        };

        let envelope: GraphQlEnvelope = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", operation, e)))?;

        if let Some(err) = envelope.errors.first() {
            let lowered = err.message.to_lowercase();
            if lowered.contains("unauthorized")
                || lowered.contains("unauthenticated")
                || lowered.contains("authentication credentials")
            {
                return Err(ApiError::Unauthorized);
            }
            if envelope.data.as_ref().map(Value::is_null).unwrap_or(true) {
                return Err(ApiError::InvalidResponse(format!(
                    "{}: {}",
                    operation, err.message
                )));
            }
            debug!(operation, error = %err.message, "GraphQL returned partial errors");
        }

        let data = envelope
            .data
            .ok_or_else(|| ApiError::InvalidResponse(format!("{}: missing data", operation)))?;
        serde_json::from_value(data)
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", operation, e)))
    }
}

#[async_trait]
impl RemoteClient for MonarchClient {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let body = json!({
            "username": email,
            "password": password,
            "supports_mfa": true,
            "trusted_device": false,
        });
        let response = self.post_login(&body).await?;

        match response.status().as_u16() {
            200..=299 => Ok(LoginResponse::Token(Self::read_token(response).await?)),
            403 => Ok(LoginResponse::MfaRequired),
            400 | 401 | 404 => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::InvalidCredentials(
                    ApiError::from_status(StatusCode::BAD_REQUEST, &body).to_string(),
                ))
            }
            _ => Err(Self::check_response(response)
                .await
                .err()
                .unwrap_or_else(|| ApiError::InvalidResponse("unexpected login status".into()))),
        }
    }

    async fn login_mfa(
        &self,
        email: &str,
        password: &str,
        code: &str,
    ) -> Result<String, ApiError> {
        let body = json!({
            "username": email,
            "password": password,
            "supports_mfa": true,
            "trusted_device": false,
            "totp": code,
        });
        let response = self.post_login(&body).await?;

        match response.status().as_u16() {
            200..=299 => Self::read_token(response).await,
            400 | 403 => Err(ApiError::InvalidMfaCode),
            401 | 404 => Err(ApiError::InvalidCredentials(
                "credentials rejected during MFA".to_string(),
            )),
            _ => Err(Self::check_response(response)
                .await
                .err()
                .unwrap_or_else(|| ApiError::InvalidResponse("unexpected MFA status".into()))),
        }
    }

    async fn get_transactions(
        &self,
        token: &str,
        start: NaiveDate,
        end: NaiveDate,
        limit: u32,
    ) -> Result<Vec<Transaction>, ApiError> {
        let variables = json!({
            "offset": 0,
            "limit": limit,
            "filters": {
                "startDate": start.format("%Y-%m-%d").to_string(),
                "endDate": end.format("%Y-%m-%d").to_string(),
            },
        });
        let data: TransactionsData = self
            .graphql(token, "GetTransactionsList", TRANSACTIONS_QUERY, variables)
            .await?;

        Ok(data
            .all_transactions
            .results
            .into_iter()
            .map(RemoteTransaction::into_transaction)
            .collect())
    }

    async fn update_transaction(
        &self,
        token: &str,
        id: &str,
        update: &TransactionUpdate,
    ) -> Result<Transaction, ApiError> {
        let mut input = serde_json::Map::new();
        input.insert("id".to_string(), json!(id));
        if let Some(ref notes) = update.notes {
            input.insert("notes".to_string(), json!(notes));
        }
        if let Some(ref category_id) = update.category_id {
            input.insert("category".to_string(), json!(category_id));
        }
        if let Some(needs_review) = update.needs_review {
            input.insert("needsReview".to_string(), json!(needs_review));
        }
        if let Some(ref merchant) = update.merchant_name {
            input.insert("name".to_string(), json!(merchant));
        }
        if let Some(amount) = update.amount {
            input.insert("amount".to_string(), json!(amount));
        }
        if let Some(ref date) = update.date {
            input.insert("date".to_string(), json!(date));
        }

        let data: UpdateData = self
            .graphql(
                token,
                "Web_TransactionDrawerUpdateTransaction",
                UPDATE_TRANSACTION_MUTATION,
                json!({ "input": Value::Object(input) }),
            )
            .await?;

        let payload = data.update_transaction;
        let messages = payload
            .errors
            .as_ref()
            .map(PayloadErrors::messages)
            .unwrap_or_default();

        match payload.transaction {
            Some(txn) if messages.is_empty() => Ok(txn.into_transaction()),
            _ => {
                let joined = messages.join("; ");
                let lowered = joined.to_lowercase();
                if joined.is_empty()
                    || lowered.contains("not found")
                    || lowered.contains("does not exist")
                {
                    Err(ApiError::NotFound(format!("transaction {}", id)))
                } else {
                    Err(ApiError::Validation(joined))
                }
            }
        }
    }

    async fn keep_alive_ping(&self, token: &str) -> Result<(), ApiError> {
        let _: Value = self.graphql(token, "GetAccounts", PING_QUERY, json!({})).await?;
        Ok(())
    }
}
