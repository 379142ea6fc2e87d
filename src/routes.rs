use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::error;

use crate::chain_client::ChainClientRegistry;
use crate::entities::now_epoch;
use crate::error::WithdrawError;
use crate::events::EventEnvelope;
use crate::notifier::ChangeNotifier;
use crate::store::{CheckbookStore, FailedTxStore, InMemoryStore, WithdrawRequestStore};
use crate::tx_builder::LocalKeySigner;
use crate::tx_queue::TxQueue;
use crate::withdraw::{CreateWithdrawal, WithdrawOrchestrator};

pub type Queue = TxQueue<ChainClientRegistry, LocalKeySigner>;
pub type Orchestrator = WithdrawOrchestrator<Queue>;

pub struct AppState {
    pub store: Arc<InMemoryStore>,
    pub notifier: Arc<ChangeNotifier>,
    pub orchestrator: Arc<Orchestrator>,
    pub tx_queue: Arc<Queue>,
    pub event_tx: mpsc::Sender<EventEnvelope>,
    pub started_at: u64,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl From<WithdrawError> for ApiError {
    fn from(e: WithdrawError) -> Self {
        match e {
            WithdrawError::NotFound(_) | WithdrawError::AllocationNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            WithdrawError::AllocationNotIdle(_)
            | WithdrawError::NullifierInUse(_)
            | WithdrawError::CancelAfterExecute
            | WithdrawError::Precondition(_)
            | WithdrawError::RetryLimit(_) => ApiError::Conflict(e.to_string()),
            WithdrawError::MixedOwners
            | WithdrawError::MissingNullifier(_)
            | WithdrawError::EmptyAllocationSet
            | WithdrawError::Type(_) => ApiError::BadRequest(e.to_string()),
            WithdrawError::Store(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "NOT_FOUND", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "CONFLICT", m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", m),
            ApiError::Internal(m) => {
                // Internal details stay in the server logs.
                error!(error = %m, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal error".to_string(),
                )
            }
        };
        let body = json!({ "error": message, "code": code });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "uptime_secs": now_epoch().saturating_sub(state.started_at),
        "subscribers": state.notifier.subscriber_count(),
        "entities": state.store.depths(),
    }))
}

/// Bus adapter: envelopes from the event stream are injected here and
/// consumed by the processor loop.
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<EventEnvelope>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .event_tx
        .send(envelope)
        .await
        .map_err(|_| ApiError::Unavailable("event stream closed".into()))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))))
}

pub async fn create_withdrawal(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CreateWithdrawal>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state.orchestrator.create(input).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn get_withdrawal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state
        .store
        .get_withdraw_request(&id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("withdraw request not found: {id}")))?;
    Ok(Json(request))
}

pub async fn get_checkbook(
    State(state): State<Arc<AppState>>,
    Path((chain_id, deposit_id)): Path<(u32, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let id = crate::entities::CheckbookId::new(chain_id, deposit_id);
    let checkbook = state
        .store
        .get_checkbook(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("checkbook not found: {id}")))?;
    Ok(Json(checkbook))
}

pub async fn cancel_withdrawal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.cancel(&id).await?;
    Ok(Json(json!({ "cancelled": true })))
}

pub async fn execute_withdrawal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.execute(&id).await?;
    Ok(Json(json!({ "submitted": true })))
}

pub async fn retry_payout(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.retry_payout(&id).await?;
    Ok(Json(json!({ "retried": "payout" })))
}

pub async fn retry_hook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.retry_hook(&id).await?;
    Ok(Json(json!({ "retried": "hook" })))
}

pub async fn retry_fallback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.retry_fallback(&id).await?;
    Ok(Json(json!({ "retried": "fallback" })))
}

pub async fn list_failed_transactions(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state
        .store
        .list_failed_txs()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(records))
}

pub async fn retry_failed_transaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let new_id = state
        .tx_queue
        .retry_failed_transaction(&id)
        .await
        .map_err(|e| {
            if e.is_stale() {
                ApiError::Conflict(e.to_string())
            } else {
                ApiError::NotFound(e.to_string())
            }
        })?;
    Ok(Json(json!({ "pending_tx_id": new_id })))
}
