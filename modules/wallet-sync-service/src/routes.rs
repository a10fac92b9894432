//! Axum route handlers for the wallet sync RPC API.

use crate::error::SyncError;
use crate::poller::{parse_address, TrackedAddressSet};
use crate::worker::ReconcilerHandle;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use ethers::types::Address;
use std::sync::Arc;
use std::time::Instant;
use wallet_sync_types::*;

pub struct AppState {
    pub reconciler: ReconcilerHandle,
    pub start_time: Instant,
    pub block_poll_ms: u64,
}

fn error_status(error: &SyncError) -> StatusCode {
    match error {
        SyncError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        SyncError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure<T: serde::Serialize>(error: SyncError) -> (StatusCode, Json<RpcResponse<T>>) {
    (error_status(&error), Json(RpcResponse::err(error.to_string())))
}

// =====================================================
// Wallet Endpoints
// =====================================================

// GET /rpc/wallets/list
pub async fn wallets_list(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<WalletRecord>>>) {
    match state.reconciler.snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(RpcResponse::ok(snapshot.ordered_records()))),
        Err(e) => failure(e),
    }
}

// POST /rpc/wallets/get
pub async fn wallets_get(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GetWalletRequest>,
) -> (StatusCode, Json<RpcResponse<WalletRecord>>) {
    let address = match parse_address(&req.address) {
        Ok(a) => a,
        Err(e) => return failure(e),
    };

    match state.reconciler.snapshot().await {
        Ok(snapshot) => {
            if !snapshot.wallets_addresses.contains(&address) {
                return (
                    StatusCode::NOT_FOUND,
                    Json(RpcResponse::err(format!("{:?} is not being watched", address))),
                );
            }
            let record = snapshot
                .wallets
                .get(&address)
                .cloned()
                .unwrap_or_else(|| WalletRecord::new(address));
            (StatusCode::OK, Json(RpcResponse::ok(record)))
        }
        Err(e) => failure(e),
    }
}

// POST /rpc/wallets/refresh
pub async fn wallets_refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> (StatusCode, Json<RpcResponse<usize>>) {
    let addresses = match req.addresses.as_deref().map(TrackedAddressSet::parse) {
        Some(Ok(set)) => Some(set),
        Some(Err(e)) => return failure(e),
        None => None,
    };

    match state.reconciler.refresh(addresses).await {
        Ok(queued) => (StatusCode::OK, Json(RpcResponse::ok(queued))),
        Err(e) => failure(e),
    }
}

// =====================================================
// Watch List Endpoints
// =====================================================

// POST /rpc/watchlist/set
pub async fn watchlist_set(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetWatchlistRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    let addresses = match TrackedAddressSet::parse(&req.addresses) {
        Ok(set) => set,
        Err(e) => return failure(e),
    };

    match state.reconciler.set_addresses(addresses).await {
        Ok(changed) => (StatusCode::OK, Json(RpcResponse::ok(changed))),
        Err(e) => failure(e),
    }
}

// GET /rpc/watchlist/list
pub async fn watchlist_list(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<Address>>>) {
    match state.reconciler.snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(RpcResponse::ok(snapshot.wallets_addresses))),
        Err(e) => failure(e),
    }
}

// =====================================================
// Service
// =====================================================

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let snapshot = match state.reconciler.snapshot().await {
        Ok(s) => s,
        Err(e) => return failure(e),
    };
    let stats = match state.reconciler.stats().await {
        Ok(s) => s,
        Err(e) => return failure(e),
    };

    let status = ServiceStatus {
        running: true,
        uptime_secs: state.start_time.elapsed().as_secs(),
        tracked_wallets: snapshot.wallets_addresses.len(),
        resolved_wallets: snapshot.wallets.len(),
        subscription: snapshot.subscription.map(|h| h.0),
        last_block: stats.last_block,
        last_tick_at: stats.last_tick_at,
        batches_merged: stats.batches_merged,
        batches_discarded: stats.batches_discarded,
        batches_in_flight: stats.batches_in_flight,
        fetch_failures: stats.fetch_failures,
        subscription_failures: stats.subscription_failures,
        last_error: stats.last_error,
        block_poll_ms: state.block_poll_ms,
    };
    (StatusCode::OK, Json(RpcResponse::ok(status)))
}
