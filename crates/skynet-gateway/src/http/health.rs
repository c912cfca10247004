//! `GET /`, `GET /health` — liveness (§6).

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

pub async fn root_handler() -> &'static str {
    "skynet-gateway"
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cli_stats = state.cli_manager.get_stats().await;
    let messaging = state.messaging.as_ref().map(|m| {
        json!({
            "platform": m.platform.name(),
            "connected": m.platform.is_connected(),
        })
    });

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "cli_sessions": {
            "active": cli_stats.active_sessions,
            "pending": cli_stats.pending_sessions,
            "max": cli_stats.max_sessions,
            "busy": cli_stats.busy_count,
        },
        "messaging": messaging,
    }))
}
