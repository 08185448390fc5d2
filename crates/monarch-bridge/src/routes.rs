//! HTTP surface.
//!
//! Thin mapping from REST calls onto the session manager and transaction
//! proxy. Every failure carries a distinct `error` code so callers can tell
//! an expired session from a transient outage.

use std::sync::Arc;

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use monarch_bridge_core::auth::Credentials;
use monarch_bridge_core::models::TransactionUpdate;
use monarch_bridge_core::{
    BridgeError, LoginOutcome, SessionManager, SessionStatus, TransactionProxy, UpdateResult,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Lookback used when `GET /transactions` has no `days` parameter.
const DEFAULT_LOOKBACK_DAYS: i64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub proxy: TransactionProxy,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let proxy = TransactionProxy::new(Arc::clone(&manager));
        Self { manager, proxy }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct MfaRequest {
    pub code: String,
    #[serde(default)]
    pub challenge_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    session: SessionStatus,
}

/// Error wrapper that renders a `BridgeError` as a JSON response.
pub struct ApiFailure(pub BridgeError);

impl From<BridgeError> for ApiFailure {
    fn from(err: BridgeError) -> Self {
        ApiFailure(err)
    }
}

// Malformed requests keep the same `{error, message}` body as every other
// failure instead of axum's plain-text rejection.
impl From<JsonRejection> for ApiFailure {
    fn from(rejection: JsonRejection) -> Self {
        ApiFailure(BridgeError::ValidationError(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiFailure {
    fn from(rejection: QueryRejection) -> Self {
        ApiFailure(BridgeError::ValidationError(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiFailure {
    fn from(rejection: PathRejection) -> Self {
        ApiFailure(BridgeError::ValidationError(rejection.body_text()))
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match err {
            BridgeError::AuthRejected(_) | BridgeError::SessionExpired => StatusCode::UNAUTHORIZED,
            BridgeError::InvalidMfaCode => StatusCode::BAD_REQUEST,
            BridgeError::NoPendingChallenge => StatusCode::CONFLICT,
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BridgeError::RemoteUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::LoginTimeout => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "error": err.code(),
            "message": err.to_string(),
        });
        if err.is_transient() {
            body["hint"] = json!("remote service did not respond; retry later");
        }
        if status.is_server_error() {
            warn!(status = %status, error = %err, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        session: state.manager.status().await,
    })
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiFailure> {
    let Json(req) = payload?;
    let credentials = Credentials::new(req.email, req.password);
    let body = match state.manager.login(&credentials).await? {
        LoginOutcome::Authenticated => json!({ "status": "authenticated" }),
        LoginOutcome::MfaRequired { challenge_id } => {
            json!({ "status": "mfa_required", "challenge_id": challenge_id })
        }
    };
    Ok(Json(body))
}

async fn mfa(
    State(state): State<AppState>,
    payload: Result<Json<MfaRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiFailure> {
    let Json(req) = payload?;
    state
        .manager
        .submit_mfa_code(&req.code, req.challenge_id.as_deref())
        .await?;
    Ok(Json(json!({ "status": "authenticated" })))
}

async fn abort_mfa(State(state): State<AppState>) -> Result<impl IntoResponse, ApiFailure> {
    state.manager.abort_mfa().await?;
    Ok(Json(json!({ "status": "unauthenticated" })))
}

async fn list_transactions(
    State(state): State<AppState>,
    query: Result<Query<TransactionsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiFailure> {
    let Query(query) = query?;
    let days = query.days.unwrap_or(DEFAULT_LOOKBACK_DAYS);
    let transactions = state.proxy.list_transactions(days).await?;
    Ok(Json(transactions))
}

async fn update_transaction(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
    payload: Result<Json<TransactionUpdate>, JsonRejection>,
) -> Result<Response, ApiFailure> {
    let Path(id) = id?;
    let Json(update) = payload?;
    let response = match state.proxy.update_transaction(&id, update).await? {
        UpdateResult::Updated(txn) => Json(txn).into_response(),
        UpdateResult::NoChange => Json(json!({
            "status": "no_change",
            "message": "No fields to update",
        }))
        .into_response(),
    };
    Ok(response)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/mfa", post(mfa))
        .route("/auth/abort", post(abort_mfa))
        .route("/transactions", get(list_transactions))
        .route("/transactions/{id}", patch(update_transaction))
        .with_state(state)
}
