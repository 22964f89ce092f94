// =============================================================================
// tickfold — Main Entry Point
// =============================================================================
//
// Wires the engine together: load config, fail fast on an unresolvable frame
// spec, then spawn the connection manager, the liveness monitor and the query
// API server, and wait for shutdown.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod connection;
mod frame_clock;
mod liveness;
mod market_data;
mod runtime_config;
mod sink;
mod types;
mod wire;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::connection::ConnectionManager;
use crate::market_data::CandleAggregator;
use crate::runtime_config::RuntimeConfig;
use crate::sink::{CsvHistorySink, HistorySink};

/// Upper bound on how long startup waits for the feed to reach Open before
/// logging a warning and carrying on (the manager keeps reconnecting).
const STARTUP_OPEN_WAIT: Duration = Duration::from_secs(15);

const CONFIG_PATH: &str = "tickfold.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("tickfold — tick-to-candle aggregation engine starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Env overrides for the values that change per deployment.
    if let Ok(symbol) = std::env::var("TICKFOLD_SYMBOL") {
        config.symbol = symbol.trim().to_uppercase();
    }
    if let Ok(endpoint) = std::env::var("TICKFOLD_ENDPOINT") {
        config.endpoint = endpoint;
    }
    if let Ok(addr) = std::env::var("TICKFOLD_BIND_ADDR") {
        config.bind_addr = addr;
    }

    // Frame-computation errors are fatal at construction time: refuse to
    // start with undefined candle boundaries.
    let frame_spec = config.frame_spec();
    frame_spec
        .validate()
        .context("invalid frame specification")?;

    info!(
        symbol = %config.symbol,
        endpoint = %config.endpoint,
        frame = %frame_spec,
        max_history = config.max_history,
        "Configured feed"
    );

    // ── 2. History sink ──────────────────────────────────────────────────
    let sink: Option<Arc<dyn HistorySink>> = config
        .history_csv_path
        .as_ref()
        .map(|p| Arc::new(CsvHistorySink::new(PathBuf::from(p))) as Arc<dyn HistorySink>);

    // ── 3. Aggregator & connection manager ───────────────────────────────
    let aggregator = Arc::new(CandleAggregator::new(
        frame_spec,
        config.max_history,
        sink,
    )?);

    let connection = Arc::new(ConnectionManager::new(
        config.endpoint.clone(),
        config.symbol.clone(),
        config.backoff_policy(),
        aggregator.clone(),
    ));

    let state = Arc::new(AppState::new(
        config.clone(),
        aggregator.clone(),
        connection.clone(),
    ));

    // ── 4. Spawn the feed supervision loop ───────────────────────────────
    let feed = connection.clone();
    let feed_task = tokio::spawn(async move {
        if let Err(e) = feed.run().await {
            error!(error = %e, "Feed supervision ended fatally");
        }
    });

    match connection.wait_until_open(STARTUP_OPEN_WAIT).await {
        Ok(()) => info!("Feed connection open"),
        Err(e) => warn!(error = %e, "Feed not open yet — reconnect loop continues in background"),
    }

    // ── 5. Liveness monitor ──────────────────────────────────────────────
    tokio::spawn(liveness::run_liveness_monitor(
        aggregator.clone(),
        connection.clone(),
        config.liveness_settings(),
    ));

    // ── 6. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    connection.close();
    let _ = feed_task.await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("tickfold shut down complete.");
    Ok(())
}
