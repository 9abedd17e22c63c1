// ============================================================================
// Zeteo Server - Entitlement read API + event indexer host
// ============================================================================
// Routes:
//   GET /entitlement/:account    resolve an account's entitlement payload
//   GET /api/airdrop/:account    same, legacy path
//   GET /health                  liveness + cache mode
//
// Outcomes: 200 payload, 404 NO_SUBSCRIPTION, 500 CONTRACT_ERROR.
// An account that does not parse holds nothing and is a 404.
// ============================================================================

use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use zeteo_core::{
    Address, Clock, EntitlementError, EventIndexer, PayloadBuilder, ReconciliationEngine,
    ServiceConfig, SystemClock,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// HTTP API
// ============================================================================

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    engine: Arc<ReconciliationEngine>,
    clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(engine: Arc<ReconciliationEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }
}

fn error_response(status: StatusCode, message: &str, code: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message,
            "code": code,
        })),
    )
        .into_response()
}

async fn get_entitlement(State(state): State<AppState>, Path(account): Path<String>) -> Response {
    let account = match Address::parse(&account) {
        Ok(account) => account,
        Err(e) => {
            debug!("Unparseable account {:?}: {}", account, e);
            let missing = EntitlementError::NoSubscription;
            return error_response(StatusCode::NOT_FOUND, &missing.to_string(), missing.code());
        }
    };

    match state.engine.resolve(&account).await {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(e @ EntitlementError::NoSubscription) => {
            error_response(StatusCode::NOT_FOUND, &e.to_string(), e.code())
        }
        Err(e @ EntitlementError::OracleUnavailable(_)) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to verify subscription on-chain, please try again",
            e.code(),
        ),
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": VERSION,
        "timestamp": state.clock.now(),
        "cacheEnabled": state.engine.cache_enabled(),
    }))
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/entitlement/:account", get(get_entitlement))
        .route("/api/airdrop/:account", get(get_entitlement))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Application Setup
// ============================================================================

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("zeteo_server_lib=debug".parse()?)
                .add_directive("zeteo_core=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Load configuration, wire components, serve until Ctrl-C
pub async fn run() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }
    init_tracing()?;

    info!("Starting Zeteo entitlement server v{}", VERSION);

    let config = ServiceConfig::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let chain = config.chain_client()?;
    let oracle = Arc::new(config.oracle(chain.clone())?);
    let curator: Arc<dyn PayloadBuilder> = Arc::new(config.curator(clock.clone())?);
    let cache = config.open_cache();

    info!(
        "Ledger {} | contract {} | cache {}",
        config.rpc_url,
        oracle.contract(),
        cache.backend_name()
    );

    let engine = Arc::new(ReconciliationEngine::new(
        oracle,
        curator.clone(),
        cache.clone(),
        clock.clone(),
    ));

    let shutdown = CancellationToken::new();

    let indexer_handle = if config.indexer_enabled && cache.is_enabled() {
        let indexer = EventIndexer::new(chain, curator, cache, clock.clone(), config.indexer_config()?);
        Some(tokio::spawn(indexer.run(shutdown.clone())))
    } else {
        info!("Event indexer disabled (enabled: {}, cache: {})", config.indexer_enabled, cache.is_enabled());
        None
    };

    let app = router(AppState::new(engine, clock));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| anyhow!("Failed to bind {}: {}", config.listen_addr, e))?;
    info!("Listening on {}", config.listen_addr);

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await
        .map_err(|e| anyhow!("Server error: {}", e))?;

    shutdown.cancel();
    if let Some(handle) = indexer_handle {
        if let Err(e) = handle.await {
            warn!("Event indexer task ended abnormally: {}", e);
        }
    }

    info!("Zeteo server stopped");
    Ok(())
}
