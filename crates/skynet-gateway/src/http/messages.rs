//! `POST /v1/messages`, `POST /v1/messages/count_tokens`, `GET /v1/models`
//! (§6 HTTP surface), composed the way the teacher's `http/openai_compat.rs`
//! composes its chat-completions route: `Router::new().route(...)`, an
//! `Arc<AppState>` handed to every handler, streaming via a raw
//! `text/event-stream` body since §9 Open Question (a) mandates always
//! streaming regardless of the request's `stream` flag.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::warn;

use skynet_agent::anthropic::{CountTokensRequest, CountTokensResponse, MessagesRequest};
use skynet_agent::converter::{convert_messages, convert_tools};
use skynet_agent::openai::{build_request_body, OutboundRequest};
use skynet_agent::sse::estimate_output_tokens;
use skynet_agent::translate_stream;
use skynet_core::BrokerError;

use crate::app::AppState;

/// Prefix recognised on the `Authorization` bearer token (or `x-api-key`) that
/// selects a per-request provider model override instead of the configured
/// default (§6: "a `freecc:<override>` bearer/api-key format selects a
/// per-request override").
const OVERRIDE_PREFIX: &str = "freecc:";

fn extract_model_override(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))?;

    raw.strip_prefix(OVERRIDE_PREFIX).map(|s| s.to_string())
}

/// Any Claude-shaped model name is normalized to the configured provider
/// model; a non-Claude-shaped name (already an upstream model id) passes
/// through unchanged (§4.8, §6).
fn normalize_model(requested: &str, configured: &str, override_model: Option<&str>) -> String {
    if let Some(o) = override_model {
        return o.to_string();
    }
    if requested.to_ascii_lowercase().contains("claude") {
        configured.to_string()
    } else {
        requested.to_string()
    }
}

fn error_response(err: BrokerError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_anthropic_envelope())).into_response()
}

/// `POST /v1/messages` — always streams (§9 Open Question (a)).
pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MessagesRequest>,
) -> Response {
    let override_model = extract_model_override(&headers);
    let model = normalize_model(&req.model, &state.config.provider.model, override_model.as_deref());

    let openai_messages = convert_messages(&req.system, &req.messages);
    let tools = convert_tools(&req.tools);
    let thinking_requested = req.thinking.is_some();

    let outbound = OutboundRequest {
        model: model.clone(),
        messages: openai_messages,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.clone(),
        tools,
        thinking_requested,
    };

    let body = build_request_body(&outbound, true);
    let input_tokens = estimate_request_tokens(&body);

    let resp = state
        .provider_limiter
        .execute_with_retry(|| state.provider_client.send_stream(&body), 3, 1.0, 30.0, 1.0)
        .await;

    let resp = match resp {
        Ok(r) => r,
        Err(e) => return error_response(e.into_broker_error()),
    };

    let events = translate_stream(resp, model, input_tokens);
    let sse_body = events.map(|chunk| Ok::<_, Infallible>(chunk));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(sse_body))
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to build SSE response");
            error_response(BrokerError::Internal(e.to_string()))
        })
}

/// `POST /v1/messages/count_tokens` — same counter used by the stream path.
pub async fn count_tokens_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CountTokensRequest>,
) -> Json<CountTokensResponse> {
    let _ = &state.config.provider.model; // counting is model-independent (char-based estimate)
    let openai_messages = convert_messages(&req.system, &req.messages);
    let tools = convert_tools(&req.tools);
    let body = serde_json::json!({ "messages": openai_messages, "tools": tools });
    Json(CountTokensResponse {
        input_tokens: estimate_request_tokens(&body),
    })
}

/// `GET /v1/models` — contents of the configured local JSON catalogue file.
pub async fn models_handler(State(state): State<Arc<AppState>>) -> Response {
    match tokio::fs::read_to_string(&state.config.server.models_catalogue_path).await {
        Ok(contents) => match serde_json::from_str::<Value>(&contents) {
            Ok(v) => Json(v).into_response(),
            Err(e) => {
                warn!(error = %e, "models catalogue is not valid JSON");
                error_response(BrokerError::Internal("invalid models catalogue".to_string()))
            }
        },
        Err(e) => {
            warn!(error = %e, path = %state.config.server.models_catalogue_path, "models catalogue not found");
            Json(serde_json::json!({ "data": [] })).into_response()
        }
    }
}

/// Approximate input tokens from the serialized request body (§4.6's
/// `estimate_output_tokens`, reused here for the input side since both are
/// the same char/4 heuristic).
fn estimate_request_tokens(body: &Value) -> u32 {
    let chars = serde_json::to_string(body).map(|s| s.len()).unwrap_or(0);
    estimate_output_tokens(chars, 0)
}
