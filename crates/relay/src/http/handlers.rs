// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay endpoint handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use serde::Serialize;

use crate::account::Provider;
use crate::http::AppState;
use crate::relay::KeyInfo;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
}

/// `GET /health` — liveness plus a store ping.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = match state.store.ping().await {
        Ok(()) => "ok".to_owned(),
        Err(e) => format!("error: {e}"),
    };
    let status = if store == "ok" { "ok" } else { "degraded" };
    Json(HealthResponse { status: status.to_owned(), store })
}

/// `POST /v1/messages` — Claude relay.
pub async fn claude_messages(
    State(state): State<Arc<AppState>>,
    Extension(key): Extension<KeyInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.pipeline.handle(&key, Provider::Claude, body, headers).await
}

/// `POST /v1/messages/count_tokens` — token counting passthrough.
pub async fn count_tokens(
    State(state): State<Arc<AppState>>,
    Extension(key): Extension<KeyInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.pipeline.handle_count_tokens(&key, body, headers).await
}

/// `POST /openai/responses` — Codex relay, always streaming.
pub async fn codex_responses(
    State(state): State<Arc<AppState>>,
    Extension(key): Extension<KeyInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.pipeline.handle(&key, Provider::Codex, body, headers).await
}

/// `POST /api/event_logging/batch` — CLI telemetry sink. Absorbed so the
/// client stays quiet; nothing is forwarded upstream.
pub async fn event_logging() -> impl IntoResponse {
    Json(serde_json::json!({"success": true}))
}
