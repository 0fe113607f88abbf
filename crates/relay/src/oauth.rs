// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Browser OAuth bootstrap: authorization code + PKCE (RFC 7636).
//!
//! Produces the initial `(access_token, refresh_token, expires_in)` tuple
//! for a new account. Handshake state lives in the store's TTL map and is
//! consumed by the code exchange.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::account::Provider;
use crate::token::{provider_client_id, TokenResponse};

/// Authorization endpoint for a provider's browser flow.
pub fn provider_authorize_url(provider: Provider) -> &'static str {
    match provider {
        Provider::Claude => "https://claude.ai/oauth/authorize",
        Provider::Codex => "https://auth.openai.com/oauth/authorize",
    }
}

/// Redirect URI registered for the CLI client id.
pub fn provider_redirect_uri(provider: Provider) -> &'static str {
    match provider {
        Provider::Claude => "https://console.anthropic.com/oauth/code/callback",
        Provider::Codex => "http://localhost:1455/auth/callback",
    }
}

/// OAuth scopes requested during bootstrap.
pub fn provider_scopes(provider: Provider) -> &'static str {
    match provider {
        Provider::Claude => "org:create_api_key user:profile user:inference",
        Provider::Codex => "openid profile email offline_access",
    }
}

/// Generate a PKCE code verifier (43-128 char URL-safe random string).
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// code_challenge = base64url_nopad(sha256(verifier)).
pub fn compute_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Random `state` parameter.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the full authorization URL with PKCE parameters.
pub fn build_auth_url(provider: Provider, code_challenge: &str, state: &str) -> String {
    format!(
        "{auth_url}?code=true\
         &client_id={client_id}\
         &response_type=code\
         &redirect_uri={redirect_uri}\
         &scope={scope}\
         &code_challenge={code_challenge}\
         &code_challenge_method=S256\
         &state={state}",
        auth_url = provider_authorize_url(provider),
        client_id = urlencoding(provider_client_id(provider)),
        redirect_uri = urlencoding(provider_redirect_uri(provider)),
        scope = urlencoding(provider_scopes(provider)),
        code_challenge = urlencoding(code_challenge),
        state = urlencoding(state),
    )
}

/// Exchange an authorization code for tokens (JSON body, matching the CLI).
pub async fn exchange_code(
    client: &reqwest::Client,
    provider: Provider,
    code: &str,
    code_verifier: &str,
    state: &str,
) -> anyhow::Result<TokenResponse> {
    let json_body = serde_json::json!({
        "grant_type": "authorization_code",
        "client_id": provider_client_id(provider),
        "code": code,
        "redirect_uri": provider_redirect_uri(provider),
        "code_verifier": code_verifier,
        "state": state,
    });

    let resp = client
        .post(crate::token::provider_token_url(provider))
        .header("Content-Type", "application/json")
        .body(json_body.to_string())
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("token exchange failed ({status}): {text}");
    }

    Ok(resp.json().await?)
}

/// Form-style encoding for URL query parameters (spaces as `+`).
fn urlencoding(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(char::from(HEX[(b >> 4) as usize]));
                out.push(char::from(HEX[(b & 0xf) as usize]));
            }
        }
    }
    out
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

#[cfg(test)]
#[path = "oauth_tests.rs"]
mod tests;
