//! `POST /stop` (§6, §7): stops all CLI sessions and all tree queues,
//! returning the number of nodes cancelled.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;

pub async fn stop_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.cli_manager.stop_all().await;

    let cancelled = match state.tree_queue() {
        Some(tree_queue) => tree_queue.cancel_all().await.len(),
        None => 0,
    };

    info!(cancelled, "/stop executed");
    Json(json!({ "cancelled": cancelled }))
}
