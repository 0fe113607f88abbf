// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP surface: relay endpoints, admin API, auth middleware.

pub mod admin;
pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::RelayConfig;
use crate::crypto::Cipher;
use crate::relay::RelayPipeline;
use crate::store::Store;
use crate::transport::TransportManager;

/// Shared handler state.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub pipeline: Arc<RelayPipeline>,
    pub cipher: Arc<Cipher>,
    pub transports: Arc<TransportManager>,
    pub config: RelayConfig,
}

/// Build the axum `Router` with all relay routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_body_bytes() + 64 * 1024;
    Router::new()
        // Health (no auth)
        .route("/health", get(handlers::health))
        // Relay surface
        .route("/v1/messages", post(handlers::claude_messages))
        .route("/v1/messages/count_tokens", post(handlers::count_tokens))
        .route("/openai/responses", post(handlers::codex_responses))
        // Telemetry sink (absorbed, never forwarded)
        .route("/api/event_logging/batch", post(handlers::event_logging))
        // Admin: accounts
        .route("/admin/accounts", get(admin::list_accounts))
        .route(
            "/admin/accounts/{id}",
            get(admin::get_account).put(admin::update_account).delete(admin::delete_account),
        )
        // Admin: users
        .route("/admin/users", post(admin::create_user).get(admin::list_users))
        .route("/admin/users/{id}", delete(admin::delete_user))
        .route("/admin/users/{id}/regenerate", post(admin::regenerate_user_token))
        // Admin: dashboard queries
        .route("/admin/logs", get(admin::query_logs))
        .route("/admin/usage", get(admin::usage_summary))
        // Admin: OAuth bootstrap
        .route("/admin/oauth/authorize", post(admin::oauth_authorize))
        .route("/admin/oauth/exchange", post(admin::oauth_exchange))
        // Middleware
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
