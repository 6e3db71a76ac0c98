//! HTTP surface for the external scheduler.
//!
//! Scanning and monitoring run as plain request/response cycles: cron (or a
//! human) POSTs to /api/scan and /api/monitor, the work happens inline, and
//! the structured report comes back in the response body.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

use crate::engine::{Monitor, PositionManager};
use crate::scanner::Scanner;

pub struct AppState {
    pub scanner: Scanner,
    pub monitor: Monitor,
    pub manager: Arc<PositionManager>,
    /// Default symbol universe when a scan request names none.
    pub symbols: Vec<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/scan", post(run_scan))
        .route("/api/monitor", post(run_monitor))
        .route("/api/positions", get(get_positions))
        .with_state(state)
}

/// Request body for POST /api/scan
#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    /// Overrides the configured universe when present
    pub symbols: Option<Vec<String>>,
    /// When true, classify only; no orders are placed
    #[serde(default)]
    pub dry_run: bool,
}

/// GET /api/health - liveness probe
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// POST /api/scan - scan the universe and enter on signals
async fn run_scan(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ScanRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let symbols = request.symbols.unwrap_or_else(|| state.symbols.clone());

    if request.dry_run {
        let report = state.scanner.scan(&symbols).await;
        return (StatusCode::OK, Json(serde_json::json!(report)));
    }

    match state.scanner.scan_and_enter(&symbols, &state.manager).await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e) => {
            error!("Scan cycle failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

/// POST /api/monitor - run one exit-monitoring cycle
async fn run_monitor(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.monitor.run_cycle().await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e) => {
            error!("Monitoring cycle failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

/// GET /api/positions - all open positions
async fn get_positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.manager.store().open_positions().await {
        Ok(positions) => (StatusCode::OK, Json(serde_json::json!({"positions": positions}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}
