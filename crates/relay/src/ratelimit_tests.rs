// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{HeaderName, HeaderValue};

use super::*;
use crate::crypto::Cipher;

fn pauses() -> ErrorPauses {
    ErrorPauses {
        on_401: Duration::from_secs(1800),
        on_403: Duration::from_secs(600),
        on_429: Duration::from_secs(300),
        on_529: Duration::from_secs(300),
    }
}

fn manager(store: Arc<crate::store::memory::MemoryStore>) -> Arc<RateLimitManager> {
    RateLimitManager::new(
        store,
        pauses(),
        "http://127.0.0.1:9".into(),
        "http://127.0.0.1:9".into(),
    )
}

fn tokens(store: Arc<crate::store::memory::MemoryStore>) -> Arc<TokenManager> {
    TokenManager::new(
        store,
        TransportManager::new(Duration::from_secs(2)),
        Arc::new(Cipher::new("k")),
        Duration::from_secs(60),
    )
}

async fn seed(store: &crate::store::memory::MemoryStore, id: &str, extra: &[(&str, &str)]) {
    let mut row = RowMap::new();
    row.insert("id".into(), id.into());
    row.insert("provider".into(), "claude".into());
    row.insert("status".into(), "active".into());
    row.insert("schedulable".into(), "true".into());
    for (k, v) in extra {
        row.insert(k.to_string(), v.to_string());
    }
    let _ = store.set_account(id, row).await;
}

fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in pairs {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(*k), HeaderValue::from_str(v)) {
            map.insert(name, value);
        }
    }
    map
}

fn account_from(store_row: &RowMap) -> Account {
    Account::from_row(store_row).expect("seeded row must parse")
}

#[test]
fn reset_header_parses_epoch_seconds_and_rfc3339() {
    assert_eq!(parse_reset("1700000000"), Some(1_700_000_000_000));
    assert_eq!(parse_reset("2026-08-01T10:00:00Z"), Some(1_785_578_400_000));
    assert_eq!(parse_reset("soon"), None);
}

#[tokio::test]
async fn rejected_5h_status_cools_the_account() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[]).await;
    let manager = manager(Arc::clone(&store));

    let reset_s = (epoch_ms() / 1000) + 120;
    let h = headers(&[
        ("anthropic-ratelimit-unified-5h-status", "rejected"),
        ("anthropic-ratelimit-unified-5h-reset", &reset_s.to_string()),
    ]);
    manager.capture_headers("a1", Provider::Claude, &h).await?;

    let row = store.get_account("a1").await?;
    assert_eq!(row.get("fiveHourStatus").map(String::as_str), Some("rejected"));
    assert_eq!(row.get("schedulable").map(String::as_str), Some("false"));
    let until: u64 = row.get("overloadedUntil").and_then(|v| v.parse().ok()).unwrap_or(0);
    assert!(until > epoch_ms(), "overloadedUntil must be in the future");
    Ok(())
}

#[tokio::test]
async fn allowed_warning_is_recorded_but_not_acted_on() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[]).await;
    let manager = manager(Arc::clone(&store));

    let h = headers(&[("anthropic-ratelimit-unified-5h-status", "allowed_warning")]);
    manager.capture_headers("a1", Provider::Claude, &h).await?;

    let row = store.get_account("a1").await?;
    assert_eq!(row.get("fiveHourStatus").map(String::as_str), Some("allowed_warning"));
    assert_eq!(row.get("schedulable").map(String::as_str), Some("true"));
    Ok(())
}

#[tokio::test]
async fn near_full_window_with_future_reset_cools_the_account() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[]).await;
    let manager = manager(Arc::clone(&store));

    let reset_s = (epoch_ms() / 1000) + 600;
    let h = headers(&[
        ("anthropic-ratelimit-unified-7d-utilization", "0.995"),
        ("anthropic-ratelimit-unified-7d-reset", &reset_s.to_string()),
    ]);
    manager.capture_headers("a1", Provider::Claude, &h).await?;

    let row = store.get_account("a1").await?;
    assert_eq!(row.get("schedulable").map(String::as_str), Some("false"));
    assert_eq!(row.get("sevenDayUtil").map(String::as_str), Some("0.995"));
    Ok(())
}

#[tokio::test]
async fn moderate_utilization_only_records() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[]).await;
    let manager = manager(Arc::clone(&store));

    let reset_s = (epoch_ms() / 1000) + 600;
    let h = headers(&[
        ("anthropic-ratelimit-unified-5h-utilization", "0.42"),
        ("anthropic-ratelimit-unified-5h-reset", &reset_s.to_string()),
    ]);
    manager.capture_headers("a1", Provider::Claude, &h).await?;

    let row = store.get_account("a1").await?;
    assert_eq!(row.get("fiveHourUtil").map(String::as_str), Some("0.42"));
    assert_eq!(row.get("schedulable").map(String::as_str), Some("true"));
    Ok(())
}

#[tokio::test]
async fn codex_twin_windows_pick_the_longer_cooldown() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "c1", &[("provider", "codex")]).await;
    let manager = manager(Arc::clone(&store));

    let h = headers(&[
        ("x-codex-primary-used-percent", "100"),
        ("x-codex-primary-reset-after-seconds", "60"),
        ("x-codex-secondary-used-percent", "99.5"),
        ("x-codex-secondary-reset-after-seconds", "3600"),
    ]);
    let before = epoch_ms();
    manager.capture_headers("c1", Provider::Codex, &h).await?;

    let row = store.get_account("c1").await?;
    let until: u64 = row.get("overloadedUntil").and_then(|v| v.parse().ok()).unwrap_or(0);
    // The secondary window's hour-long reset must win over the primary's minute.
    assert!(until >= before + 3_500_000, "cooldown too short: {}", until.saturating_sub(before));
    Ok(())
}

#[tokio::test]
async fn status_529_applies_the_configured_pause() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[]).await;
    let manager = manager(Arc::clone(&store));
    let tokens = tokens(Arc::clone(&store));

    let account = account_from(&store.get_account("a1").await?);
    let before = epoch_ms();
    manager
        .on_retriable_status(&account, 529, "", false, &HeaderMap::new(), &tokens)
        .await?;

    let row = store.get_account("a1").await?;
    let until: u64 = row.get("overloadedUntil").and_then(|v| v.parse().ok()).unwrap_or(0);
    assert!(until >= before + 295_000 && until <= before + 310_000);
    Ok(())
}

#[tokio::test]
async fn ban_signal_in_403_blocks_the_account() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[]).await;
    let manager = manager(Arc::clone(&store));
    let tokens = tokens(Arc::clone(&store));

    let account = account_from(&store.get_account("a1").await?);
    let body = format!(
        "{}{}",
        "Your organization has been disabled following a review. ",
        "x".repeat(300)
    );
    let before = epoch_ms();
    manager
        .on_retriable_status(&account, 403, &body, false, &HeaderMap::new(), &tokens)
        .await?;

    let row = store.get_account("a1").await?;
    assert_eq!(row.get("status").map(String::as_str), Some("blocked"));
    assert_eq!(row.get("schedulable").map(String::as_str), Some("false"));
    let message = row.get("errorMessage").cloned().unwrap_or_default();
    assert_eq!(message.chars().count(), 200, "error message must be truncated");
    let until: u64 = row.get("overloadedUntil").and_then(|v| v.parse().ok()).unwrap_or(0);
    assert!(until >= before + 1_790_000, "blocked accounts pause for the 401 duration");
    Ok(())
}

#[tokio::test]
async fn generic_403_gets_the_shorter_pause() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[]).await;
    let manager = manager(Arc::clone(&store));
    let tokens = tokens(Arc::clone(&store));

    let account = account_from(&store.get_account("a1").await?);
    let before = epoch_ms();
    manager
        .on_retriable_status(&account, 403, "forbidden", false, &HeaderMap::new(), &tokens)
        .await?;

    let row = store.get_account("a1").await?;
    assert_ne!(row.get("status").map(String::as_str), Some("blocked"));
    let until: u64 = row.get("overloadedUntil").and_then(|v| v.parse().ok()).unwrap_or(0);
    assert!(until >= before + 595_000 && until <= before + 610_000);
    Ok(())
}

#[tokio::test]
async fn status_401_marks_error_and_schedules_cooldown() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[]).await;
    let manager = manager(Arc::clone(&store));
    let tokens = tokens(Arc::clone(&store));

    let account = account_from(&store.get_account("a1").await?);
    manager
        .on_retriable_status(&account, 401, "", false, &HeaderMap::new(), &tokens)
        .await?;

    let row = store.get_account("a1").await?;
    assert_eq!(row.get("status").map(String::as_str), Some("error"));
    assert_eq!(
        row.get("errorMessage").map(String::as_str),
        Some("upstream 401: authentication failed")
    );
    let until: u64 = row.get("overloadedUntil").and_then(|v| v.parse().ok()).unwrap_or(0);
    assert!(until > epoch_ms());
    Ok(())
}

#[tokio::test]
async fn opus_429_sets_the_opus_window() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[]).await;
    let manager = manager(Arc::clone(&store));
    let tokens = tokens(Arc::clone(&store));

    let reset_s = (epoch_ms() / 1000) + 240;
    let h = headers(&[("anthropic-ratelimit-unified-reset", &reset_s.to_string())]);
    let account = account_from(&store.get_account("a1").await?);
    manager.on_retriable_status(&account, 429, "", true, &h, &tokens).await?;

    let row = store.get_account("a1").await?;
    let opus_until: u64 =
        row.get("opusRateLimitEndAt").and_then(|v| v.parse().ok()).unwrap_or(0);
    assert_eq!(opus_until, reset_s * 1000);
    Ok(())
}

#[tokio::test]
async fn cleanup_lifts_expired_cooldowns_and_unblocks() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    let past = epoch_ms().saturating_sub(1000);
    seed(
        &store,
        "a1",
        &[
            ("status", "blocked"),
            ("schedulable", "false"),
            ("overloadedAt", &past.to_string()),
            ("overloadedUntil", &past.to_string()),
            ("fiveHourStatus", "rejected"),
            ("opusRateLimitEndAt", &past.to_string()),
        ],
    )
    .await;
    let manager = manager(Arc::clone(&store));

    manager.cleanup_pass().await?;

    let row = store.get_account("a1").await?;
    assert_eq!(row.get("status").map(String::as_str), Some("active"));
    assert_eq!(row.get("schedulable").map(String::as_str), Some("true"));
    assert_eq!(row.get("overloadedUntil").map(String::as_str), Some(""));
    assert_eq!(row.get("fiveHourStatus").map(String::as_str), Some(""));
    assert_eq!(row.get("opusRateLimitEndAt").map(String::as_str), Some(""));
    Ok(())
}

#[tokio::test]
async fn cleanup_leaves_live_cooldowns_alone() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    let future = epoch_ms() + 600_000;
    seed(
        &store,
        "a1",
        &[("schedulable", "false"), ("overloadedUntil", &future.to_string())],
    )
    .await;
    let manager = manager(Arc::clone(&store));

    manager.cleanup_pass().await?;

    let row = store.get_account("a1").await?;
    assert_eq!(row.get("schedulable").map(String::as_str), Some("false"));
    assert_eq!(row.get("overloadedUntil").map(String::as_str), Some(&future.to_string()[..]));
    Ok(())
}

#[tokio::test]
async fn cleanup_heals_active_but_unschedulable_accounts() -> anyhow::Result<()> {
    let store = Arc::new(crate::store::memory::MemoryStore::ephemeral());
    seed(&store, "a1", &[("schedulable", "false")]).await;
    let manager = manager(Arc::clone(&store));

    manager.cleanup_pass().await?;

    let row = store.get_account("a1").await?;
    assert_eq!(row.get("schedulable").map(String::as_str), Some("true"));
    Ok(())
}

#[test]
fn staleness_detects_expired_resets_and_missing_resets() {
    let mut row = RowMap::new();
    row.insert("id".into(), "a".into());
    row.insert("provider".into(), "claude".into());
    let mut account = account_from(&row);
    let now_s = 1_000_000u64;

    assert!(!window_is_stale(&account, now_s));

    account.five_hour_util = Some(0.5);
    assert!(window_is_stale(&account, now_s), "utilization without reset is stale");

    account.five_hour_reset = Some(now_s + 60);
    assert!(!window_is_stale(&account, now_s));

    account.five_hour_reset = Some(now_s - 60);
    assert!(window_is_stale(&account, now_s), "expired reset is stale");
}
