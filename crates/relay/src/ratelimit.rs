// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-account rate-limit state machine.
//!
//! Upstream responses drive two inputs: rate-limit headers on any response,
//! and the retriable status codes the pipeline hands over before failing to
//! another account. Two background loops keep the state honest: a cleanup
//! pass that lifts expired cooldowns, and a re-probe pass that refreshes
//! window data for accounts with no organic traffic.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use axum::http::header::HeaderMap;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::account::{epoch_ms, Account, AccountStatus, Provider, RowMap};
use crate::store::Store;
use crate::token::TokenManager;
use crate::transport::TransportManager;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const REPROBE_INTERVAL: Duration = Duration::from_secs(60);

/// A window at or past this utilization counts as exhausted.
const EXHAUSTED_UTILIZATION: f64 = 0.99;

/// Fallback cooldown when the 5h window rejects without a usable reset.
const FIVE_HOURS: Duration = Duration::from_secs(5 * 3600);

/// Whether an error body carries an account-level ban signal (as opposed to
/// a transient 403).
pub fn is_ban_signal(body: &str) -> bool {
    ban_signal_re().is_match(body)
}

// The pattern is a compile-time constant.
#[allow(clippy::unwrap_used)]
fn ban_signal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)organization has been disabled|account has been disabled|Too many active sessions|only authorized for use with claude code",
        )
        .unwrap()
    })
}

/// Cooldown durations per upstream status.
#[derive(Debug, Clone, Copy)]
pub struct ErrorPauses {
    pub on_401: Duration,
    pub on_403: Duration,
    pub on_429: Duration,
    pub on_529: Duration,
}

pub struct RateLimitManager {
    store: Arc<dyn Store>,
    pauses: ErrorPauses,
    claude_api_url: String,
    codex_api_url: String,
}

/// Parse a reset header value: epoch seconds or RFC3339. Returns epoch ms.
fn parse_reset(value: &str) -> Option<u64> {
    if let Ok(epoch_s) = value.trim().parse::<u64>() {
        return Some(epoch_s * 1000);
    }
    chrono::DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.timestamp_millis().max(0) as u64)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    header_str(headers, name).and_then(|v| v.trim().parse().ok())
}

impl RateLimitManager {
    pub fn new(
        store: Arc<dyn Store>,
        pauses: ErrorPauses,
        claude_api_url: String,
        codex_api_url: String,
    ) -> Arc<Self> {
        Arc::new(Self { store, pauses, claude_api_url, codex_api_url })
    }

    /// Record rate-limit headers from any upstream response.
    pub async fn capture_headers(
        &self,
        account_id: &str,
        provider: Provider,
        headers: &HeaderMap,
    ) -> anyhow::Result<()> {
        let now = epoch_ms();
        let mut fields = RowMap::new();
        let mut cooldown_until: Option<u64> = None;

        match provider {
            Provider::Claude => {
                let reset_5h = header_str(headers, "anthropic-ratelimit-unified-5h-reset")
                    .or_else(|| header_str(headers, "anthropic-ratelimit-unified-reset"))
                    .and_then(parse_reset);

                if let Some(status) = header_str(headers, "anthropic-ratelimit-unified-5h-status")
                {
                    fields.insert("fiveHourStatus".into(), status.to_owned());
                    if status == "rejected" {
                        let until = reset_5h.unwrap_or(now + FIVE_HOURS.as_millis() as u64);
                        cooldown_until = Some(cooldown_until.unwrap_or(0).max(until));
                    }
                }
                if let Some(reset) = reset_5h {
                    fields.insert("fiveHourReset".into(), (reset / 1000).to_string());
                }
                if let Some(util) =
                    header_f64(headers, "anthropic-ratelimit-unified-5h-utilization")
                {
                    fields.insert("fiveHourUtil".into(), util.to_string());
                    if let Some(reset) = reset_5h {
                        if util >= EXHAUSTED_UTILIZATION && reset > now {
                            cooldown_until = Some(cooldown_until.unwrap_or(0).max(reset));
                        }
                    }
                }
                let reset_7d = header_str(headers, "anthropic-ratelimit-unified-7d-reset")
                    .and_then(parse_reset);
                if let Some(reset) = reset_7d {
                    fields.insert("sevenDayReset".into(), (reset / 1000).to_string());
                }
                if let Some(util) =
                    header_f64(headers, "anthropic-ratelimit-unified-7d-utilization")
                {
                    fields.insert("sevenDayUtil".into(), util.to_string());
                    if let Some(reset) = reset_7d {
                        if util >= EXHAUSTED_UTILIZATION && reset > now {
                            cooldown_until = Some(cooldown_until.unwrap_or(0).max(reset));
                        }
                    }
                }
            }
            Provider::Codex => {
                for (prefix, util_key, reset_key) in [
                    ("x-codex-primary", "codexPrimaryUtil", "codexPrimaryReset"),
                    ("x-codex-secondary", "codexSecondaryUtil", "codexSecondaryReset"),
                ] {
                    let used = header_f64(headers, &format!("{prefix}-used-percent"));
                    let reset_after =
                        header_f64(headers, &format!("{prefix}-reset-after-seconds"));
                    if let Some(percent) = used {
                        let util = (percent / 100.0).clamp(0.0, 1.0);
                        fields.insert(util_key.into(), util.to_string());
                        if let Some(after) = reset_after {
                            let reset_ms = now + (after.max(0.0) * 1000.0) as u64;
                            fields.insert(reset_key.into(), (reset_ms / 1000).to_string());
                            if util >= EXHAUSTED_UTILIZATION {
                                // Both windows exhausted: the longer wait wins.
                                cooldown_until =
                                    Some(cooldown_until.unwrap_or(0).max(reset_ms));
                            }
                        }
                    }
                }
            }
        }

        if let Some(until) = cooldown_until {
            fields.insert("schedulable".into(), "false".into());
            fields.insert("overloadedAt".into(), now.to_string());
            fields.insert("overloadedUntil".into(), until.to_string());
            tracing::info!(
                account_id,
                until_ms = until,
                "rate-limit window exhausted, cooling account"
            );
        }
        if fields.is_empty() {
            return Ok(());
        }
        self.store.update_account(account_id, fields).await
    }

    /// Side effects for a retriable upstream status, before the pipeline
    /// moves on to another account.
    pub async fn on_retriable_status(
        &self,
        account: &Account,
        status: u16,
        body: &str,
        is_opus: bool,
        headers: &HeaderMap,
        tokens: &Arc<TokenManager>,
    ) -> anyhow::Result<()> {
        let now = epoch_ms();
        let mut fields = RowMap::new();

        match status {
            529 => {
                fields.insert("overloadedAt".into(), now.to_string());
                fields.insert(
                    "overloadedUntil".into(),
                    (now + self.pauses.on_529.as_millis() as u64).to_string(),
                );
            }
            429 => {
                let reset = header_str(headers, "anthropic-ratelimit-unified-reset")
                    .or_else(|| header_str(headers, "anthropic-ratelimit-unified-5h-reset"))
                    .and_then(parse_reset);
                let until = reset.unwrap_or(now + self.pauses.on_429.as_millis() as u64);
                fields.insert("overloadedAt".into(), now.to_string());
                fields.insert("overloadedUntil".into(), until.to_string());
                if is_opus {
                    fields.insert("opusRateLimitEndAt".into(), until.to_string());
                }
            }
            403 => {
                if ban_signal_re().is_match(body) {
                    fields.insert("status".into(), "blocked".into());
                    fields.insert("schedulable".into(), "false".into());
                    fields.insert(
                        "overloadedUntil".into(),
                        (now + self.pauses.on_401.as_millis() as u64).to_string(),
                    );
                    fields
                        .insert("errorMessage".into(), body.chars().take(200).collect::<String>());
                    tracing::warn!(account_id = %account.id, "ban signal in 403 body, blocking account");
                } else {
                    fields.insert("overloadedAt".into(), now.to_string());
                    fields.insert(
                        "overloadedUntil".into(),
                        (now + self.pauses.on_403.as_millis() as u64).to_string(),
                    );
                }
            }
            401 => {
                fields.insert("status".into(), "error".into());
                fields.insert(
                    "errorMessage".into(),
                    "upstream 401: authentication failed".into(),
                );
                fields.insert(
                    "overloadedUntil".into(),
                    (now + self.pauses.on_401.as_millis() as u64).to_string(),
                );
                // The cached token is suspect: refresh it off the request path.
                let tokens = Arc::clone(tokens);
                let account_id = account.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = tokens.force_refresh(&account_id).await {
                        tracing::warn!(account_id, err = %e, "post-401 refresh failed");
                    }
                });
            }
            _ => return Ok(()),
        }

        self.store.update_account(&account.id, fields).await
    }

    /// Spawn the 5-minute cleanup pass.
    pub fn spawn_cleanup_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(CLEANUP_INTERVAL);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }
                if let Err(e) = manager.cleanup_pass().await {
                    tracing::warn!(err = %e, "rate-limit cleanup pass failed");
                }
            }
        });
    }

    /// Lift expired cooldowns and self-heal inconsistent scheduling state.
    pub async fn cleanup_pass(&self) -> anyhow::Result<()> {
        let now = epoch_ms();
        for id in self.store.list_account_ids().await? {
            let row = self.store.get_account(&id).await?;
            let Some(account) = Account::from_row(&row) else {
                continue;
            };

            let mut fields = RowMap::new();
            let overload_expired =
                account.overloaded_until.is_some_and(|until| now >= until);
            if overload_expired {
                fields.insert("overloadedAt".into(), String::new());
                fields.insert("overloadedUntil".into(), String::new());
                fields.insert("fiveHourStatus".into(), String::new());
                if account.status == AccountStatus::Blocked {
                    fields.insert("status".into(), "active".into());
                }
                fields.insert("schedulable".into(), "true".into());
            }
            if account.opus_rate_limit_end_at.is_some_and(|until| now >= until) {
                fields.insert("opusRateLimitEndAt".into(), String::new());
            }
            // Active but unschedulable with no live cooldown: stuck, re-enable.
            if account.status == AccountStatus::Active
                && !account.schedulable
                && account.overloaded_until.is_none_or(|until| now >= until)
            {
                fields.insert("schedulable".into(), "true".into());
            }

            if !fields.is_empty() {
                tracing::debug!(account_id = %id, "rate-limit cleanup applied");
                self.store.update_account(&id, fields).await?;
            }
        }
        Ok(())
    }

    /// Spawn the 1-minute stale re-probe pass.
    pub fn spawn_reprobe_loop(
        self: &Arc<Self>,
        tokens: Arc<TokenManager>,
        transports: Arc<TransportManager>,
        shutdown: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(REPROBE_INTERVAL);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }
                if let Err(e) = manager.reprobe_pass(&tokens, &transports).await {
                    tracing::warn!(err = %e, "rate-limit re-probe pass failed");
                }
            }
        });
    }

    /// Refresh window data for active accounts whose reported state is stale:
    /// a reset timestamp already in the past, or utilization with no reset.
    async fn reprobe_pass(
        &self,
        tokens: &Arc<TokenManager>,
        transports: &Arc<TransportManager>,
    ) -> anyhow::Result<()> {
        let now_s = epoch_ms() / 1000;
        for id in self.store.list_account_ids().await? {
            let row = self.store.get_account(&id).await?;
            let Some(account) = Account::from_row(&row) else {
                continue;
            };
            if account.status != AccountStatus::Active || !account.schedulable {
                continue;
            }
            if !window_is_stale(&account, now_s) {
                continue;
            }
            if let Err(e) = self.probe_account(&account, tokens, transports).await {
                tracing::debug!(account_id = %id, err = %e, "re-probe request failed");
            }
        }
        Ok(())
    }

    /// One minimal upstream call, made only to read fresh rate-limit headers.
    async fn probe_account(
        &self,
        account: &Account,
        tokens: &Arc<TokenManager>,
        transports: &Arc<TransportManager>,
    ) -> anyhow::Result<()> {
        let access_token = tokens.ensure_valid(&account.id).await?;
        let client = transports.client_for(account.proxy.as_ref()).await?;

        let resp = match account.provider {
            Provider::Claude => {
                client
                    .post(format!("{}/v1/messages", self.claude_api_url))
                    .bearer_auth(&access_token)
                    .header("anthropic-version", "2023-06-01")
                    .json(&serde_json::json!({
                        "model": "claude-3-5-haiku-20241022",
                        "max_tokens": 1,
                        "messages": [{"role": "user", "content": "hi"}],
                    }))
                    .send()
                    .await?
            }
            Provider::Codex => {
                let mut req = client
                    .post(format!("{}/codex/responses", self.codex_api_url))
                    .bearer_auth(&access_token)
                    .json(&serde_json::json!({
                        "model": "codex-mini-latest",
                        "input": [{"role": "user", "content": "hi"}],
                        "stream": true,
                        "max_output_tokens": 1,
                    }));
                if let Some(chatgpt_id) = account.chatgpt_account_id() {
                    req = req.header("Chatgpt-Account-Id", chatgpt_id);
                }
                req.send().await?
            }
        };

        let headers = resp.headers().clone();
        // Read the tiny probe body to completion so the connection returns
        // to the pool instead of being torn down mid-stream.
        let _ = resp.bytes().await;
        self.capture_headers(&account.id, account.provider, &headers).await
    }
}

/// Stale means: a reset that already passed, or utilization without a reset.
fn window_is_stale(account: &Account, now_s: u64) -> bool {
    let stale_pair = |util: Option<f64>, reset: Option<u64>| match (util, reset) {
        (Some(_), None) => true,
        (Some(_), Some(reset)) => reset <= now_s,
        _ => false,
    };
    match account.provider {
        Provider::Claude => {
            stale_pair(account.five_hour_util, account.five_hour_reset)
                || stale_pair(account.seven_day_util, account.seven_day_reset)
        }
        Provider::Codex => {
            stale_pair(account.codex_primary_util, account.codex_primary_reset)
                || stale_pair(account.codex_secondary_util, account.codex_secondary_reset)
        }
    }
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
