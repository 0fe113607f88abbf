// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request identity transformation.
//!
//! Rewrites the parsed request body and headers so every dispatched request
//! looks like it originates from the selected account: the client's own
//! identity markers are stripped or replaced, and per-account stainless
//! fingerprints are pinned on first sight and replayed afterwards.

use std::sync::Arc;
use std::sync::OnceLock;

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;
use serde_json::Value;

use crate::account::{Account, Provider};
use crate::crypto::sha256_hex;
use crate::store::Store;

/// Headers forwarded upstream. Everything else — client credentials,
/// `x-forwarded-*`, CDN headers — is dropped.
const HEADER_WHITELIST: &[&str] = &[
    "accept",
    "content-type",
    "user-agent",
    "anthropic-version",
    "anthropic-beta",
    "anthropic-dangerous-direct-browser-access",
    "x-app",
];

/// Stainless headers pinned per account. `retry-count` and `read-timeout`
/// vary per call and pass through unchanged.
const STAINLESS_FINGERPRINT_KEYS: &[&str] = &[
    "x-stainless-os",
    "x-stainless-arch",
    "x-stainless-runtime",
    "x-stainless-runtime-version",
    "x-stainless-lang",
    "x-stainless-package-version",
];

// The patterns below are compile-time constants.
#[allow(clippy::unwrap_used)]
fn user_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^user_[0-9a-f]{64}_account__session_(.+)$").unwrap())
}

#[allow(clippy::unwrap_used)]
fn billing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)x-anthropic-billing-header").unwrap())
}

/// Output of one transformation.
#[derive(Debug)]
pub struct TransformedRequest {
    pub body: Value,
    pub headers: HeaderMap,
    /// 16-hex routing hash; empty when the request carries nothing stable.
    pub session_hash: String,
}

pub struct IdentityTransformer {
    store: Arc<dyn Store>,
    max_cache_controls: usize,
    api_version: String,
    default_beta: String,
}

impl IdentityTransformer {
    pub fn new(
        store: Arc<dyn Store>,
        max_cache_controls: usize,
        api_version: String,
        default_beta: String,
    ) -> Arc<Self> {
        Arc::new(Self { store, max_cache_controls, api_version, default_beta })
    }

    /// Apply the full transformation for a dispatch to `account`.
    pub async fn transform(
        &self,
        mut body: Value,
        client_headers: &HeaderMap,
        account: &Account,
        access_token: &str,
    ) -> anyhow::Result<TransformedRequest> {
        strip_billing_prompts(&mut body);
        enforce_cache_controls(&mut body, self.max_cache_controls);

        let rewritten_user_id = rewrite_user_id(&mut body, account);
        let session_hash = derive_session_hash(&body, rewritten_user_id.as_deref());

        let mut headers = filter_headers(client_headers);
        self.bind_stainless_headers(&mut headers, account).await?;
        self.add_required_headers(&mut headers, client_headers, account, access_token)?;

        Ok(TransformedRequest { body, headers, session_hash })
    }

    /// Pin the account's stainless fingerprint on first sight, then replay
    /// the stored one on every later request. Upstream correlates these
    /// headers to the account; letting them drift with the client would look
    /// like the account changed machines.
    async fn bind_stainless_headers(
        &self,
        headers: &mut HeaderMap,
        account: &Account,
    ) -> anyhow::Result<()> {
        let mut observed = serde_json::Map::new();
        for key in STAINLESS_FINGERPRINT_KEYS {
            if let Some(value) = headers.get(*key).and_then(|v| v.to_str().ok()) {
                observed.insert((*key).to_owned(), Value::String(value.to_owned()));
            }
        }
        if !observed.is_empty() {
            let json = Value::Object(observed).to_string();
            self.store.set_stainless_fingerprint_nx(&account.id, &json).await?;
        }

        let Some(stored) = self.store.get_stainless_fingerprint(&account.id).await? else {
            return Ok(());
        };
        let stored: serde_json::Map<String, Value> =
            serde_json::from_str(&stored).unwrap_or_default();

        for key in STAINLESS_FINGERPRINT_KEYS {
            headers.remove(*key);
            if let Some(value) = stored.get(*key).and_then(Value::as_str) {
                if let (Ok(name), Ok(value)) =
                    (HeaderName::try_from(*key), HeaderValue::from_str(value))
                {
                    headers.insert(name, value);
                }
            }
        }
        Ok(())
    }

    fn add_required_headers(
        &self,
        headers: &mut HeaderMap,
        client_headers: &HeaderMap,
        account: &Account,
        access_token: &str,
    ) -> anyhow::Result<()> {
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {access_token}"))
                .map_err(|_| anyhow::anyhow!("access token is not header-safe"))?,
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        if account.provider == Provider::Claude {
            headers.insert(
                "anthropic-version",
                HeaderValue::from_str(&self.api_version)
                    .unwrap_or_else(|_| HeaderValue::from_static("2023-06-01")),
            );
            let client_beta = client_headers
                .get("anthropic-beta")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let merged = merge_beta_values(client_beta, &self.default_beta);
            if !merged.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&merged) {
                    headers.insert("anthropic-beta", value);
                }
            }
        }
        Ok(())
    }
}

/// Drop system entries carrying the client's billing marker prompt.
fn strip_billing_prompts(body: &mut Value) {
    let Some(system) = body.get_mut("system").and_then(Value::as_array_mut) else {
        return;
    };
    system.retain(|entry| {
        let text = entry.get("text").and_then(Value::as_str).unwrap_or("");
        !billing_re().is_match(text)
    });
}

/// Drop `ttl` from every `cache_control` block, then cap the number of
/// blocks at `max`, removing from `messages` before `system`.
fn enforce_cache_controls(body: &mut Value, max: usize) {
    let mut total = 0usize;
    for key in ["system", "messages"] {
        if let Some(section) = body.get_mut(key) {
            walk_cache_controls(section, &mut |cc| {
                if let Some(obj) = cc.as_object_mut() {
                    obj.remove("ttl");
                }
                total += 1;
                true
            });
        }
    }

    let mut excess = total.saturating_sub(max);
    if excess == 0 {
        return;
    }
    // Messages give up their cache slots before the system prompt does.
    for key in ["messages", "system"] {
        if excess == 0 {
            break;
        }
        if let Some(section) = body.get_mut(key) {
            walk_cache_controls(section, &mut |_cc| {
                if excess > 0 {
                    excess -= 1;
                    false // remove
                } else {
                    true
                }
            });
        }
    }
}

/// Visit every object holding a `cache_control` key. The callback returns
/// `false` to delete the `cache_control` entry from its block.
fn walk_cache_controls(value: &mut Value, visit: &mut impl FnMut(&mut Value) -> bool) {
    match value {
        Value::Object(map) => {
            let drop_block = match map.get_mut("cache_control") {
                Some(cc) if cc.is_object() => !visit(cc),
                _ => false,
            };
            if drop_block {
                map.remove("cache_control");
            }
            for (_, child) in map.iter_mut() {
                walk_cache_controls(child, visit);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_cache_controls(item, visit);
            }
        }
        _ => {}
    }
}

/// Rewrite `metadata.user_id` to bind the request to the selected account.
///
/// Returns the rewritten id, or `None` when the request carries no user id
/// (nothing is invented in that case; the session hash falls back to
/// content-derived keys).
fn rewrite_user_id(body: &mut Value, account: &Account) -> Option<String> {
    let original = body
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())?
        .to_owned();

    let tail = user_id_re()
        .captures(&original)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("default");

    let identity_hex = sha256_hex(account.identity_uuid());
    let session_uuid = hyphenate_uuid(&sha256_hex(&format!("{}:{}", account.id, tail)));
    let rewritten = format!("user_{identity_hex}_account__session_{session_uuid}");

    if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("user_id".into(), Value::String(rewritten.clone()));
    }
    Some(rewritten)
}

/// Format the first 32 hex chars as 8-4-4-4-12.
fn hyphenate_uuid(hex: &str) -> String {
    let h = &hex[..32.min(hex.len())];
    if h.len() < 32 {
        return h.to_owned();
    }
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

/// Derive the 16-hex sticky-routing hash.
fn derive_session_hash(body: &Value, user_id: Option<&str>) -> String {
    if let Some(tail) = user_id.and_then(|id| id.split("session_").nth(1)) {
        if !tail.is_empty() {
            return short_hash(&format!("session:{tail}"));
        }
    }
    content_fingerprint(body).unwrap_or_default()
}

/// Content-derived fingerprint used when a request carries no session id:
/// system-prompt prefix, else first-message prefix.
pub fn content_fingerprint(body: &Value) -> Option<String> {
    if let Some(system) = extract_system_text(body) {
        return Some(short_hash(&format!("system:{}", prefix_chars(&system, 200))));
    }
    extract_first_message_text(body)
        .map(|message| short_hash(&format!("msg:{}", prefix_chars(&message, 200))))
}

fn short_hash(input: &str) -> String {
    sha256_hex(input)[..16].to_owned()
}

fn prefix_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn extract_system_text(body: &Value) -> Option<String> {
    match body.get("system")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(entries) => entries
            .iter()
            .find_map(|e| e.get("text").and_then(Value::as_str))
            .filter(|t| !t.is_empty())
            .map(str::to_owned),
        _ => None,
    }
}

/// Only plain string content participates in the `msg:` fallback; block
/// arrays are skipped.
fn extract_first_message_text(body: &Value) -> Option<String> {
    let first = body.get("messages")?.as_array()?.first()?;
    match first.get("content")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Keep only whitelisted headers (plus `x-stainless-*`).
fn filter_headers(client_headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in client_headers {
        let key = name.as_str();
        if HEADER_WHITELIST.contains(&key) || key.starts_with("x-stainless-") {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Order-preserving deduplicated union of two comma-separated beta lists.
fn merge_beta_values(client: &str, default: &str) -> String {
    let mut seen = Vec::new();
    for part in client.split(',').chain(default.split(',')) {
        let part = part.trim();
        if !part.is_empty() && !seen.iter().any(|s| s == part) {
            seen.push(part.to_owned());
        }
    }
    seen.join(",")
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
