// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Administrative surface: a thin layer over the store contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::account::{epoch_ms, Account, Provider, RowMap, User, UserStatus};
use crate::crypto::{sha256_hex, TOKEN_SALT};
use crate::error::RelayError;
use crate::http::AppState;
use crate::oauth;
use crate::store::OauthHandshake;

/// OAuth handshakes are short-lived by design.
const OAUTH_HANDSHAKE_TTL: Duration = Duration::from_secs(600);

/// Row fields never returned by the admin API.
const SECRET_FIELDS: &[&str] = &["accessToken", "refreshToken", "tokenHash"];

fn redact(mut row: RowMap) -> RowMap {
    for field in SECRET_FIELDS {
        row.remove(*field);
    }
    row
}

fn not_found(what: &str) -> Response {
    RelayError::NotFound.to_http_response(format!("{what} not found")).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    RelayError::InvalidRequest.to_http_response(message).into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    RelayError::Api.to_http_response(format!("store error: {e}")).into_response()
}

// ── Accounts ────────────────────────────────────────────────────────────

/// `GET /admin/accounts`
pub async fn list_accounts(State(state): State<Arc<AppState>>) -> Response {
    let ids = match state.store.list_account_ids().await {
        Ok(ids) => ids,
        Err(e) => return internal(e),
    };
    let mut accounts = Vec::with_capacity(ids.len());
    for id in ids {
        match state.store.get_account(&id).await {
            Ok(row) if !row.is_empty() => accounts.push(redact(row)),
            Ok(_) => {}
            Err(e) => return internal(e),
        }
    }
    Json(accounts).into_response()
}

/// `GET /admin/accounts/{id}`
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_account(&id).await {
        Ok(row) if row.is_empty() => not_found("account"),
        Ok(row) => Json(redact(row)).into_response(),
        Err(e) => internal(e),
    }
}

/// `PUT /admin/accounts/{id}` — merge a partial update.
pub async fn update_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut fields): Json<RowMap>,
) -> Response {
    match state.store.get_account(&id).await {
        Ok(row) if row.is_empty() => return not_found("account"),
        Ok(_) => {}
        Err(e) => return internal(e),
    }
    // Credentials only change through refresh or OAuth exchange.
    for field in SECRET_FIELDS {
        fields.remove(*field);
    }
    fields.remove("id");
    // Disabled accounts are never schedulable.
    if fields.get("status").map(String::as_str) == Some("disabled") {
        fields.insert("schedulable".into(), "false".into());
    }
    match state.store.update_account(&id, fields).await {
        Ok(()) => match state.store.get_account(&id).await {
            Ok(row) => Json(redact(row)).into_response(),
            Err(e) => internal(e),
        },
        Err(e) => internal(e),
    }
}

/// `DELETE /admin/accounts/{id}`
pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_account(&id).await {
        Ok(row) if row.is_empty() => return not_found("account"),
        Ok(_) => {}
        Err(e) => return internal(e),
    }
    match state.store.delete_account(&id).await {
        Ok(()) => Json(serde_json::json!({"id": id, "deleted": true})).into_response(),
        Err(e) => internal(e),
    }
}

// ── Users ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    #[serde(default)]
    pub bound_account_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedUserResponse {
    pub id: String,
    pub name: String,
    /// Returned exactly once; only the hash is stored.
    pub token: String,
    pub token_prefix: String,
}

fn generate_user_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill(&mut bytes);
    format!("cr_{}", hex::encode(bytes))
}

/// `POST /admin/users`
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Response {
    if req.name.trim().is_empty() {
        return bad_request("user name must not be empty");
    }
    let token = generate_user_token();
    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name.trim().to_owned(),
        token_hash: sha256_hex(&token),
        token_prefix: token.chars().take(8).collect(),
        status: UserStatus::Active,
        created_at: epoch_ms(),
        last_active_at: None,
    };
    let mut row = user.to_row();
    if let Some(bound) = req.bound_account_id.filter(|v| !v.is_empty()) {
        row.insert("boundAccountId".into(), bound);
    }
    if let Err(e) = state.store.set_user(&user.id, row).await {
        return internal(e);
    }
    Json(CreatedUserResponse {
        id: user.id,
        name: user.name,
        token,
        token_prefix: user.token_prefix,
    })
    .into_response()
}

/// `GET /admin/users`
pub async fn list_users(State(state): State<Arc<AppState>>) -> Response {
    let ids = match state.store.list_user_ids().await {
        Ok(ids) => ids,
        Err(e) => return internal(e),
    };
    let mut users = Vec::with_capacity(ids.len());
    for id in ids {
        match state.store.get_user(&id).await {
            Ok(row) if !row.is_empty() => users.push(redact(row)),
            Ok(_) => {}
            Err(e) => return internal(e),
        }
    }
    Json(users).into_response()
}

/// `DELETE /admin/users/{id}`
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_user(&id).await {
        Ok(row) if row.is_empty() => return not_found("user"),
        Ok(_) => {}
        Err(e) => return internal(e),
    }
    match state.store.delete_user(&id).await {
        Ok(()) => Json(serde_json::json!({"id": id, "deleted": true})).into_response(),
        Err(e) => internal(e),
    }
}

/// `POST /admin/users/{id}/regenerate` — rotate the token; the old one stops
/// working immediately.
pub async fn regenerate_user_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let row = match state.store.get_user(&id).await {
        Ok(row) if row.is_empty() => return not_found("user"),
        Ok(row) => row,
        Err(e) => return internal(e),
    };
    let name = row.get("name").cloned().unwrap_or_default();

    let token = generate_user_token();
    let mut fields = RowMap::new();
    fields.insert("tokenHash".into(), sha256_hex(&token));
    fields.insert("tokenPrefix".into(), token.chars().take(8).collect());
    if let Err(e) = state.store.update_user(&id, fields).await {
        return internal(e);
    }
    Json(CreatedUserResponse {
        id,
        name,
        token_prefix: token.chars().take(8).collect(),
        token,
    })
    .into_response()
}

// ── Dashboard queries ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Look-back window in hours.
    #[serde(default = "default_hours")]
    pub hours: u64,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_hours() -> u64 {
    24
}

/// `GET /admin/logs`
pub async fn query_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Response {
    let since = epoch_ms().saturating_sub(query.hours * 3_600_000);
    let result = if let Some(ref account_id) = query.account_id {
        state.store.logs_by_account(account_id, since).await
    } else if let Some(ref user_id) = query.user_id {
        state.store.logs_by_user(user_id, since).await
    } else {
        state.store.logs_by_period(since, u64::MAX).await
    };
    match result {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Default, Serialize)]
struct ModelUsage {
    requests: u64,
    input_tokens: u64,
    output_tokens: u64,
    cache_read_tokens: u64,
    cache_create_tokens: u64,
    cost_usd: f64,
}

/// `GET /admin/usage` — per-model aggregates over the look-back window.
pub async fn usage_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Response {
    let since = epoch_ms().saturating_sub(query.hours * 3_600_000);
    let logs = match state.store.logs_by_period(since, u64::MAX).await {
        Ok(logs) => logs,
        Err(e) => return internal(e),
    };
    let mut by_model: HashMap<String, ModelUsage> = HashMap::new();
    for log in &logs {
        let entry = by_model.entry(log.model.clone()).or_default();
        entry.requests += 1;
        entry.input_tokens += log.input_tokens;
        entry.output_tokens += log.output_tokens;
        entry.cache_read_tokens += log.cache_read_tokens;
        entry.cache_create_tokens += log.cache_create_tokens;
        entry.cost_usd += log.cost_usd;
    }
    Json(serde_json::json!({
        "hours": query.hours,
        "requests": logs.len(),
        "models": by_model,
    }))
    .into_response()
}

// ── OAuth bootstrap ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub provider: String,
    /// Re-authorize an existing account instead of creating a new one.
    #[serde(default)]
    pub account_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub session_id: String,
    pub auth_url: String,
}

/// `POST /admin/oauth/authorize` — start a PKCE handshake.
pub async fn oauth_authorize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthorizeRequest>,
) -> Response {
    let Some(provider) = Provider::parse(&req.provider) else {
        return bad_request(format!("unknown provider: {}", req.provider));
    };

    let code_verifier = oauth::generate_code_verifier();
    let code_challenge = oauth::compute_code_challenge(&code_verifier);
    let pkce_state = oauth::generate_state();
    let auth_url = oauth::build_auth_url(provider, &code_challenge, &pkce_state);

    let session_id = uuid::Uuid::new_v4().to_string();
    let handshake = OauthHandshake {
        account_id: req.account_id,
        provider: provider.as_str().to_owned(),
        code_verifier,
        state: pkce_state,
    };
    if let Err(e) =
        state.store.put_oauth_handshake(&session_id, handshake, OAUTH_HANDSHAKE_TTL).await
    {
        return internal(e);
    }
    Json(AuthorizeResponse { session_id, auth_url }).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub session_id: String,
    pub code: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub ext_info: Option<serde_json::Map<String, serde_json::Value>>,
}

/// `POST /admin/oauth/exchange` — finish the handshake and persist the
/// account with encrypted credentials.
pub async fn oauth_exchange(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExchangeRequest>,
) -> Response {
    let handshake = match state.store.take_oauth_handshake(&req.session_id).await {
        Ok(Some(handshake)) => handshake,
        Ok(None) => return bad_request("unknown or expired OAuth session"),
        Err(e) => return internal(e),
    };
    let Some(provider) = Provider::parse(&handshake.provider) else {
        return bad_request("handshake has an unknown provider");
    };

    let client = match state.transports.client_for(None).await {
        Ok(client) => client,
        Err(e) => return internal(e),
    };
    let token = match oauth::exchange_code(
        &client,
        provider,
        &req.code,
        &handshake.code_verifier,
        &handshake.state,
    )
    .await
    {
        Ok(token) => token,
        Err(e) => {
            return RelayError::Api
                .to_http_response(format!("code exchange failed: {e}"))
                .into_response()
        }
    };

    let now = epoch_ms();
    let id = handshake.account_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let account = Account {
        id: id.clone(),
        email: req.email.unwrap_or_default(),
        provider,
        ext_info: req.ext_info.unwrap_or_default(),
        created_at: now,
        access_token: String::new(),
        refresh_token: String::new(),
        expires_at: now + token.expires_in * 1000,
        status: crate::account::AccountStatus::Active,
        schedulable: true,
        priority: 50,
        priority_mode: crate::account::PriorityMode::Auto,
        last_used_at: None,
        last_refresh_at: Some(now),
        five_hour_status: String::new(),
        five_hour_util: None,
        five_hour_reset: None,
        seven_day_util: None,
        seven_day_reset: None,
        codex_primary_util: None,
        codex_primary_reset: None,
        codex_secondary_util: None,
        codex_secondary_reset: None,
        opus_rate_limit_end_at: None,
        overloaded_at: None,
        overloaded_until: None,
        error_message: String::new(),
        proxy: None,
    };
    let mut row = account.to_row();
    let encrypted_access = match state.cipher.encrypt(&token.access_token, TOKEN_SALT) {
        Ok(v) => v,
        Err(e) => return internal(e),
    };
    row.insert("accessToken".into(), encrypted_access);
    if let Some(ref refresh) = token.refresh_token {
        match state.cipher.encrypt(refresh, TOKEN_SALT) {
            Ok(v) => {
                row.insert("refreshToken".into(), v);
            }
            Err(e) => return internal(e),
        }
    }
    if let Err(e) = state.store.set_account(&id, row).await {
        return internal(e);
    }

    tracing::info!(account_id = %id, provider = provider.as_str(), "account authorized");
    Json(serde_json::json!({"id": id, "provider": provider.as_str()})).into_response()
}
