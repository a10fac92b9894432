//! Wallet Sync Service: keeps multisig wallet state in step with chain events.
//!
//! Hosts a small RPC API for setting the watch list and reading wallet state.
//! Default: http://127.0.0.1:9104/

mod abi;
mod config;
mod db;
mod error;
mod fetcher;
mod node;
mod poller;
mod routes;
mod store;
mod worker;

use config::Config;
use node::JsonRpcNode;
use poller::TrackedAddressSet;
use routes::AppState;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use worker::Reconciler;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env();

    log::info!("Opening database at: {}", config.db_path);
    let database = Arc::new(db::Db::open(&config.db_path).expect("Failed to open database"));

    let node = Arc::new(
        JsonRpcNode::new(config.rpc_url.clone(), config.request_timeout())
            .expect("Failed to build RPC client"),
    );
    log::info!("Using node at {}", config.rpc_url);

    let initial = match TrackedAddressSet::parse(&config.initial_addresses) {
        Ok(set) => set,
        Err(e) => {
            log::warn!("Ignoring WALLET_SYNC_ADDRESSES: {}", e);
            TrackedAddressSet::default()
        }
    };

    let cancel = CancellationToken::new();
    let (mut reconciler, handle) = Reconciler::new(node.clone(), Some(database));
    reconciler.restore(initial).await;
    tokio::spawn(reconciler.run(cancel.clone()));

    let ticker_handle = handle.clone();
    let ticker_cancel = cancel.clone();
    let poll_interval = config.block_poll_interval();
    tokio::spawn(async move {
        worker::run_block_ticker(node, ticker_handle, poll_interval, ticker_cancel).await;
    });

    let state = Arc::new(AppState {
        reconciler: handle,
        start_time: Instant::now(),
        block_poll_ms: config.block_poll_ms,
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        // Wallets
        .route(
            "/rpc/wallets/list",
            axum::routing::get(routes::wallets_list),
        )
        .route("/rpc/wallets/get", axum::routing::post(routes::wallets_get))
        .route(
            "/rpc/wallets/refresh",
            axum::routing::post(routes::wallets_refresh),
        )
        // Watch list
        .route(
            "/rpc/watchlist/set",
            axum::routing::post(routes::watchlist_set),
        )
        .route(
            "/rpc/watchlist/list",
            axum::routing::get(routes::watchlist_list),
        )
        // Service
        .route("/rpc/status", axum::routing::get(routes::status))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", config.port);
    log::info!("Wallet Sync Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutting down");
            shutdown.cancel();
        })
        .await
        .expect("Server error");
}
