// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistence contract consumed by the relay core.
//!
//! Durable state (accounts, users, request logs) lives behind stringly-typed
//! rows so backends can map fields to their own schema. Ephemeral state
//! (session bindings, sticky sessions, stainless fingerprints, OAuth
//! handshakes, refresh locks) is TTL'd and lost on restart by design.

pub mod memory;
pub mod ttl;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::account::RowMap;

/// Session-UUID → account binding, extended on each reuse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBinding {
    pub account_id: String,
    pub created_at: u64,
    pub last_used_at: u64,
}

/// In-flight browser OAuth handshake, consumed on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthHandshake {
    pub account_id: Option<String>,
    pub provider: String,
    pub code_verifier: String,
    pub state: String,
}

/// One request-log row, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub user_id: String,
    pub account_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_create_tokens: u64,
    pub cost_usd: f64,
    pub status: u16,
    pub duration_ms: u64,
    pub created_at: u64,
}

/// Store contract.
///
/// All row getters return an empty map (not an error) when the row does not
/// exist. `acquire_refresh_lock` has try-lock semantics and never blocks.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;

    // ── Account rows ────────────────────────────────────────────────────
    async fn get_account(&self, id: &str) -> anyhow::Result<RowMap>;
    /// Insert-or-replace the full row.
    async fn set_account(&self, id: &str, row: RowMap) -> anyhow::Result<()>;
    /// Merge a partial update into an existing row.
    async fn update_account(&self, id: &str, fields: RowMap) -> anyhow::Result<()>;
    async fn delete_account(&self, id: &str) -> anyhow::Result<()>;
    async fn list_account_ids(&self) -> anyhow::Result<Vec<String>>;

    // ── User rows ───────────────────────────────────────────────────────
    async fn get_user(&self, id: &str) -> anyhow::Result<RowMap>;
    async fn find_user_by_token_hash(&self, token_hash: &str) -> anyhow::Result<RowMap>;
    async fn set_user(&self, id: &str, row: RowMap) -> anyhow::Result<()>;
    async fn update_user(&self, id: &str, fields: RowMap) -> anyhow::Result<()>;
    async fn delete_user(&self, id: &str) -> anyhow::Result<()>;
    async fn list_user_ids(&self) -> anyhow::Result<Vec<String>>;

    // ── Session bindings (TTL, extended on reuse) ───────────────────────
    async fn get_session_binding(&self, session: &str)
        -> anyhow::Result<Option<SessionBinding>>;
    async fn set_session_binding(
        &self,
        session: &str,
        binding: SessionBinding,
        ttl: Duration,
    ) -> anyhow::Result<()>;
    async fn renew_session_binding(&self, session: &str, ttl: Duration) -> anyhow::Result<()>;

    // ── Sticky sessions (weaker fallback binding) ───────────────────────
    async fn get_sticky_session(&self, fingerprint: &str) -> anyhow::Result<Option<String>>;
    async fn set_sticky_session(
        &self,
        fingerprint: &str,
        account_id: &str,
        ttl: Duration,
    ) -> anyhow::Result<()>;

    // ── Stainless fingerprints (first-writer-wins, no expiry) ───────────
    async fn get_stainless_fingerprint(&self, account_id: &str)
        -> anyhow::Result<Option<String>>;
    /// Returns `true` if this call stored the fingerprint, `false` if one
    /// was already present.
    async fn set_stainless_fingerprint_nx(
        &self,
        account_id: &str,
        fingerprint_json: &str,
    ) -> anyhow::Result<bool>;

    // ── OAuth handshakes (TTL, consumed on read) ────────────────────────
    async fn put_oauth_handshake(
        &self,
        session_id: &str,
        handshake: OauthHandshake,
        ttl: Duration,
    ) -> anyhow::Result<()>;
    async fn take_oauth_handshake(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Option<OauthHandshake>>;

    // ── Refresh locks (per-account try-lock) ────────────────────────────
    async fn acquire_refresh_lock(&self, account_id: &str) -> anyhow::Result<bool>;
    async fn release_refresh_lock(&self, account_id: &str) -> anyhow::Result<()>;

    // ── Request logs ────────────────────────────────────────────────────
    async fn insert_request_log(&self, log: RequestLog) -> anyhow::Result<()>;
    async fn logs_by_period(&self, since_ms: u64, until_ms: u64)
        -> anyhow::Result<Vec<RequestLog>>;
    async fn logs_by_account(
        &self,
        account_id: &str,
        since_ms: u64,
    ) -> anyhow::Result<Vec<RequestLog>>;
    async fn logs_by_user(&self, user_id: &str, since_ms: u64)
        -> anyhow::Result<Vec<RequestLog>>;
    /// Delete logs older than the cutoff; returns how many were removed.
    async fn purge_logs_before(&self, cutoff_ms: u64) -> anyhow::Result<u64>;
}
