//! # Inbound API
//!
//! Thin `axum` handlers over the [`Sequencer`](crate::sequencer::Sequencer):
//! no business logic lives here, only request/response translation, auth
//! gating, and the `{success, data|error}` envelope every response carries.
//! Grounded in the teacher's `api::routes`/`api::responses`/`api::gateway`
//! trio, trimmed from their full HAL/pagination/webhook surface down to
//! spec.md §7's six operations plus a Prometheus scrape endpoint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthError, JwtManager, Role};
use crate::metrics::MetricRegistry;
use crate::model::{Account, Batch, Transaction, TransactionType};
use crate::sequencer::{Sequencer, SequencerError, TransactionInput};

/// Shared state every handler closes over.
pub struct AppState {
    pub sequencer: Arc<Sequencer>,
    pub auth: Arc<JwtManager>,
    pub metrics: MetricRegistry,
}

/// Envelope every response carries: `{success, data|error, code, timestamp}`
/// (spec.md §7).
#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None, code: None, timestamp: Utc::now() }
    }
}

impl ApiResponse<()> {
    fn err(code: &str, message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()), code: Some(code.to_string()), timestamp: Utc::now() }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = if self.success { StatusCode::OK } else { StatusCode::BAD_REQUEST };
        (status, Json(self)).into_response()
    }
}

/// Maps a sequencer failure to an HTTP status and a stable error code,
/// mirroring the teacher's `ApiError` code taxonomy in `api::responses`.
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<SequencerError> for ApiError {
    fn from(e: SequencerError) -> Self {
        match e {
            SequencerError::Validation(msg) => ApiError { status: StatusCode::UNPROCESSABLE_ENTITY, code: "validation_failed", message: msg },
            SequencerError::Duplicate(id) => ApiError { status: StatusCode::CONFLICT, code: "duplicate_transaction", message: id },
            SequencerError::NotFound(id) => ApiError { status: StatusCode::NOT_FOUND, code: "not_found", message: id },
            SequencerError::Store(e) => ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, code: "store_error", message: e.to_string() },
            SequencerError::Client(e) => ApiError { status: StatusCode::BAD_GATEWAY, code: "client_error", message: e.to_string() },
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InsufficientRole { .. } => ApiError { status: StatusCode::FORBIDDEN, code: "insufficient_role", message: e.to_string() },
            _ => ApiError { status: StatusCode::UNAUTHORIZED, code: "unauthorized", message: e.to_string() },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, ApiResponse::<()>::err(self.code, self.message)).into_response()
    }
}

/// Extracts `Authorization: Bearer <token>`, verifies it, and checks the
/// claimed role against `need`. Returns the verified subject on success.
fn authorize(headers: &HeaderMap, auth: &JwtManager, need: Role) -> Result<String, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError { status: StatusCode::UNAUTHORIZED, code: "missing_token", message: "missing bearer token".into() })?;

    let claims = auth.verify(token)?;
    JwtManager::require_role(claims.role, need)?;
    Ok(claims.sub)
}

#[derive(Debug, Deserialize)]
struct TransactionRequest {
    sender: String,
    recipient: String,
    amount: u64,
    nonce: u64,
    expiry_timestamp: DateTime<Utc>,
    transaction_type: TransactionType,
    #[serde(default)]
    data: Vec<u8>,
    #[serde(default)]
    signature: Vec<u8>,
    fee: u64,
}

impl From<TransactionRequest> for TransactionInput {
    fn from(r: TransactionRequest) -> Self {
        TransactionInput {
            sender: r.sender,
            recipient: r.recipient,
            amount: r.amount,
            nonce: r.nonce,
            expiry_timestamp: r.expiry_timestamp,
            transaction_type: r.transaction_type,
            data: r.data,
            signature: r.signature,
            fee: r.fee,
        }
    }
}

#[derive(Debug, Serialize)]
struct IdPayload {
    id: String,
}

async fn add_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TransactionRequest>,
) -> Result<ApiResponse<IdPayload>, ApiError> {
    authorize(&headers, &state.auth, Role::Operator)?;
    let id = state.sequencer.add_transaction(body.into()).await?;
    Ok(ApiResponse::ok(IdPayload { id }))
}

#[derive(Debug, Deserialize)]
struct PriorityTransactionRequest {
    #[serde(flatten)]
    transaction: TransactionRequest,
    priority_level: u8,
}

async fn add_priority_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PriorityTransactionRequest>,
) -> Result<ApiResponse<IdPayload>, ApiError> {
    authorize(&headers, &state.auth, Role::Operator)?;
    let id = state
        .sequencer
        .add_priority_transaction(body.transaction.into(), body.priority_level)
        .await?;
    Ok(ApiResponse::ok(IdPayload { id }))
}

async fn get_transaction_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<ApiResponse<Transaction>, ApiError> {
    authorize(&headers, &state.auth, Role::Viewer)?;
    let tx = state.sequencer.get_transaction_status(&id).await?;
    Ok(ApiResponse::ok(tx))
}

async fn get_batch_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<ApiResponse<Batch>, ApiError> {
    authorize(&headers, &state.auth, Role::Viewer)?;
    let batch = state.sequencer.get_batch_status(&id).await?;
    Ok(ApiResponse::ok(batch))
}

async fn get_account_balance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(address): Path<String>,
) -> Result<ApiResponse<Account>, ApiError> {
    authorize(&headers, &state.auth, Role::Viewer)?;
    let account = state.sequencer.get_account_balance(&address).await?;
    Ok(ApiResponse::ok(account))
}

#[derive(Debug, Serialize)]
struct StatsPayload {
    queue_depth: usize,
    queue_dropped: u64,
    pool_active_workers: usize,
    pool_tasks_completed: u64,
    pool_tasks_failed: u64,
    dedup_entries: usize,
    poll_interval_ms: u64,
}

async fn get_stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<ApiResponse<StatsPayload>, ApiError> {
    authorize(&headers, &state.auth, Role::Viewer)?;
    let stats = state.sequencer.get_stats();
    Ok(ApiResponse::ok(StatsPayload {
        queue_depth: stats.queue_depth,
        queue_dropped: stats.queue_dropped,
        pool_active_workers: stats.pool_active_workers,
        pool_tasks_completed: stats.pool_tasks_completed,
        pool_tasks_failed: stats.pool_tasks_failed,
        dedup_entries: stats.dedup_entries,
        poll_interval_ms: stats.poll_interval_ms,
    }))
}

/// Unauthenticated Prometheus text-exposition endpoint; metrics are not a
/// secret and the scraper is usually a sidecar without a token.
async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.encode_prometheus()
}

async fn health() -> &'static str {
    "ok"
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/transactions", post(add_transaction))
        .route("/v1/transactions/priority", post(add_priority_transaction))
        .route("/v1/transactions/:id", get(get_transaction_status))
        .route("/v1/batches/:id", get(get_batch_status))
        .route("/v1/accounts/:address", get(get_account_balance))
        .route("/v1/stats", get(get_stats))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MultiLevelCache, ShardedBackend, SledBackend};
    use crate::config::{CacheConfig, PrefetchConfig, QueueConfig, SequencerConfig, WorkerConfig};
    use crate::queue::PriorityQueue;
    use crate::store::InMemoryStore;
    use crate::workers::WorkerPool;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<JwtManager>) {
        let store: Arc<dyn crate::store::StoreClient> = Arc::new(InMemoryStore::new());
        let (queue, _rx) = PriorityQueue::new(QueueConfig::default(), None);
        let pool = WorkerPool::new(WorkerConfig::default());
        let cache = Arc::new(MultiLevelCache::new(
            CacheConfig::default(),
            Arc::new(SledBackend::new_temp()),
            Arc::new(ShardedBackend::new(4)),
            PrefetchConfig::default(),
        ));
        let sequencer = Sequencer::new(store, queue, pool, cache, MetricRegistry::new(), SequencerConfig::default(), 100, Duration::from_secs(5));
        let auth = Arc::new(JwtManager::new("test-secret", 3600, 3));
        let state = Arc::new(AppState { sequencer, auth: auth.clone(), metrics: MetricRegistry::new() });
        (router(state), auth)
    }

    #[tokio::test]
    async fn rejects_requests_without_a_token() {
        let (app, _auth) = app();
        let response = app
            .oneshot(Request::builder().uri("/v1/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn viewer_token_can_read_stats() {
        let (app, auth) = app();
        let token = auth.sign("viewer", Role::Viewer).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/stats")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn viewer_token_cannot_submit_transactions() {
        let (app, auth) = app();
        let token = auth.sign("viewer", Role::Viewer).unwrap();
        let body = serde_json::json!({
            "sender": "alice",
            "recipient": "bob",
            "amount": 10,
            "nonce": 0,
            "expiry_timestamp": Utc::now() + chrono::Duration::hours(1),
            "transaction_type": "Transfer",
            "fee": 1,
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/transactions")
                    .header("authorization", format!("Bearer {token}"))
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
