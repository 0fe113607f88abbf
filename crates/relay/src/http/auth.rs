// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request authentication.
//!
//! Tokens arrive as `x-api-key`, `Authorization: Bearer`, or the `cc_session`
//! cookie. The admin token is compared in constant time; user tokens are
//! SHA-256 hashed and looked up in the store.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::account::{epoch_ms, RowMap, User, UserStatus};
use crate::crypto::sha256_hex;
use crate::error::RelayError;
use crate::http::AppState;
use crate::relay::KeyInfo;

/// Marker extension present only on admin-authenticated requests.
#[derive(Debug, Clone, Copy)]
pub struct AdminPrincipal;

/// Constant-time string comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Pull the presented token out of headers, in precedence order.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Some(key.to_owned());
        }
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_owned());
            }
        }
    }
    let cookies = headers.get("cookie").and_then(|v| v.to_str().ok())?;
    for pair in cookies.split(';') {
        if let Some(value) = pair.trim().strip_prefix("cc_session=") {
            if !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

fn unauthorized(message: &str) -> Response {
    RelayError::Authentication.to_http_response(message).into_response()
}

/// Axum middleware enforcing relay authentication.
///
/// Exempt: `/health`. Admin routes additionally require the admin token.
pub async fn auth_layer(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/health" {
        return next.run(req).await;
    }

    let Some(token) = extract_token(req.headers()) else {
        return unauthorized("missing credentials");
    };

    if constant_time_eq(&token, &state.config.api_token) {
        req.extensions_mut().insert(AdminPrincipal);
        req.extensions_mut().insert(KeyInfo {
            user_id: "admin".to_owned(),
            name: "admin".to_owned(),
            bound_account_id: None,
        });
        return next.run(req).await;
    }

    if path.starts_with("/admin") {
        return unauthorized("admin token required");
    }

    let hash = sha256_hex(&token);
    let row = match state.store.find_user_by_token_hash(&hash).await {
        Ok(row) => row,
        Err(e) => {
            tracing::error!(err = %e, "user lookup failed");
            return RelayError::Api.to_http_response("credential lookup failed").into_response();
        }
    };
    let Some(user) = User::from_row(&row) else {
        return unauthorized("invalid token");
    };
    if user.status == UserStatus::Disabled {
        return unauthorized("token disabled");
    }

    // Touch lastActiveAt off the request path.
    {
        let store = Arc::clone(&state.store);
        let user_id = user.id.clone();
        tokio::spawn(async move {
            let mut fields = RowMap::new();
            fields.insert("lastActiveAt".into(), epoch_ms().to_string());
            if let Err(e) = store.update_user(&user_id, fields).await {
                tracing::debug!(user_id, err = %e, "failed to touch lastActiveAt");
            }
        });
    }

    let bound_account_id = row
        .get("boundAccountId")
        .filter(|v| !v.is_empty())
        .cloned();
    req.extensions_mut().insert(KeyInfo {
        user_id: user.id,
        name: user.name,
        bound_account_id,
    });
    next.run(req).await
}
