// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-only query surface over the aggregator. All endpoints live under
// `/api/v1/` and serve copies of the candle state; nothing here can mutate
// the aggregator. CORS is configured permissively for development; tighten
// `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/snapshot", get(snapshot))
        .route("/api/v1/last-price", get(last_price))
        .route("/api/v1/connection", get(connection))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Snapshot — current candle + history + connection status
// =============================================================================

async fn snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Last price — best-effort, from the in-progress candle's close
// =============================================================================

#[derive(Serialize)]
struct LastPriceResponse {
    symbol: String,
    price: f64,
}

async fn last_price(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.aggregator.last_price() {
        Some(price) => Json(LastPriceResponse {
            symbol: state.config.symbol.clone(),
            price,
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, "no ticks received yet").into_response(),
    }
}

// =============================================================================
// Connection status
// =============================================================================

async fn connection(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.connection_snapshot())
}
