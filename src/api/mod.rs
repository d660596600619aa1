//! Local HTTP API for swap submission, cancellation and history

use crate::config::ApiConfig;
use crate::error::{WatcherError, WatcherResult};
use crate::lifecycle::{
    CycleRestart, LifecycleController, ReimbursementDetails, SubmittedSwap, SwapSubmission,
};
use crate::notify::{Notification, Notifier};
use crate::reconcile::{ReconciliationEngine, TickReport};
use crate::state::{HistoryRecord, StateManager, TxHistory};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::H256;
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub state_manager: Arc<StateManager>,
    pub controller: Arc<LifecycleController>,
    pub engine: Arc<ReconciliationEngine>,
    pub notifier: Arc<Notifier>,
}

/// Routes of the API
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/notifications", get(get_notifications))
        .route("/history", get(list_history))
        .route("/history/:id", get(get_history))
        .route("/history/:id/reimbursement", get(get_reimbursement))
        .route("/history/:id/claim", post(claim_reimbursement))
        .route("/swaps", post(submit_swap))
        .route("/ready-txs/:id/cancel", post(cancel_ready_tx))
        .route("/ready-txs/:id/proceed", post(proceed_ready_tx))
        .route("/reconcile", post(reconcile_now))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> WatcherResult<()> {
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| WatcherError::Config(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| WatcherError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

impl IntoResponse for WatcherError {
    fn into_response(self) -> Response {
        let status = match &self {
            WatcherError::NotFound { .. } => StatusCode::NOT_FOUND,
            WatcherError::CancelWindowClosed { .. } | WatcherError::NotReimbursable { .. } => {
                StatusCode::CONFLICT
            }
            e if e.is_caller_error() => StatusCode::BAD_REQUEST,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request refused: {}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Liveness plus database reachability
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.state_manager.health_check().await.is_ok();
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if database { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database,
        }),
    )
}

/// Cycle and outcome counts
async fn get_stats(State(state): State<AppState>) -> WatcherResult<Json<StatsResponse>> {
    let stats = state.state_manager.get_stats().await?;
    Ok(Json(StatsResponse {
        open_cycles: stats.open_cycles,
        unordered: stats.unordered,
        pending: stats.pending,
        completed: stats.completed,
        rejected: stats.rejected,
        reimburse_available: stats.reimburse_available,
    }))
}

async fn get_notifications(State(state): State<AppState>) -> Json<Vec<Notification>> {
    Json(state.notifier.active())
}

async fn list_history(State(state): State<AppState>) -> WatcherResult<Json<Vec<TxHistory>>> {
    Ok(Json(state.controller.history().await?))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> WatcherResult<Json<HistoryRecord>> {
    Ok(Json(state.controller.record(id).await?))
}

async fn get_reimbursement(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> WatcherResult<Json<ReimbursementDetails>> {
    Ok(Json(state.controller.reimbursement_details(id).await?))
}

async fn claim_reimbursement(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> WatcherResult<Json<SentResponse>> {
    let tx_hash = state.controller.claim_reimbursement(id).await?;
    Ok(Json(SentResponse { tx_hash }))
}

async fn submit_swap(
    State(state): State<AppState>,
    Json(submission): Json<SwapSubmission>,
) -> WatcherResult<(StatusCode, Json<SubmittedSwap>)> {
    let submitted = state.controller.submit_swap(submission).await?;
    state.engine.trigger();
    Ok((StatusCode::CREATED, Json(submitted)))
}

async fn cancel_ready_tx(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> WatcherResult<Json<CycleRestart>> {
    let restart = state.controller.cancel_or_proceed(id, false).await?;
    state.engine.trigger();
    Ok(Json(restart))
}

async fn proceed_ready_tx(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> WatcherResult<Json<CycleRestart>> {
    let restart = state.controller.cancel_or_proceed(id, true).await?;
    state.engine.trigger();
    Ok(Json(restart))
}

/// Run a reconciliation pass inline and report what it did
async fn reconcile_now(State(state): State<AppState>) -> WatcherResult<Json<TickReport>> {
    crate::metrics::record_tick("api");
    Ok(Json(state.engine.tick().await?))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    open_cycles: u64,
    unordered: u64,
    pending: u64,
    completed: u64,
    rejected: u64,
    reimburse_available: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SentResponse {
    tx_hash: H256,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
