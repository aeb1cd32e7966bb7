//! HTTP API for health checks, balances, and transaction status

use crate::chain::AdapterRegistry;
use crate::config::ApiConfig;
use crate::coordination::{Transaction, TransactionCoordinator};
use crate::error::{MediatorError, MediatorResult};
use crate::ledger::AssetLedger;
use crate::state::Store;
use crate::types::{AccountId, Asset, ChainId, TransactionId};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TransactionCoordinator>,
    pub ledger: Arc<AssetLedger>,
    pub adapters: Arc<AdapterRegistry>,
    pub store: Arc<dyn Store>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/accounts/:id", get(get_account))
        .route("/accounts/:id/transactions", get(get_account_transactions))
        .route("/transactions/:id", get(get_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> MediatorResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| MediatorError::Internal(format!("failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| MediatorError::Internal(format!("API server stopped: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and every registered adapter
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();

    let chain_health = state.adapters.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let ready = store_ok && chains_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            store: store_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChainsResponse {
        chains: state.adapters.connected_chains(),
    })
}

async fn get_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let account = AccountId::new(id);
    match state.ledger.snapshot(&account).await {
        Some(snapshot) => Json(AccountResponse {
            account: snapshot.id.clone(),
            balances: snapshot
                .balances
                .values()
                .map(|b| BalanceView {
                    asset: b.asset,
                    total: b.total,
                    available: b.available(),
                    pending_out: b.pending_out,
                    pending_in: b.pending_in,
                })
                .collect(),
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("account {} not found", account)),
    }
}

async fn get_account_transactions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.coordinator.history(&AccountId::new(id)).await {
        Ok(history) => Json(history).into_response(),
        Err(e) => from_error(e),
    }
}

async fn get_transaction(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let tx_id: TransactionId = match id.parse() {
        Ok(tx_id) => tx_id,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, format!("invalid transaction id {}", id)),
    };

    match state.coordinator.status(tx_id).await {
        Ok(tx) => Json::<Transaction>(tx).into_response(),
        Err(e) => from_error(e),
    }
}

fn from_error(err: MediatorError) -> Response {
    let status = match &err {
        MediatorError::TransactionNotFound { .. } => StatusCode::NOT_FOUND,
        MediatorError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: ChainId,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainId>,
}

#[derive(Serialize)]
struct AccountResponse {
    account: AccountId,
    balances: Vec<BalanceView>,
}

#[derive(Serialize)]
struct BalanceView {
    asset: Asset,
    total: i64,
    available: i64,
    pending_out: i64,
    pending_in: i64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
