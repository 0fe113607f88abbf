// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::config::RelayConfig;
use crate::crypto::Cipher;
use crate::ratelimit::ErrorPauses;
use crate::store::memory::MemoryStore;

fn test_config() -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        db_path: "unused".into(),
        encryption_key: "test-key".into(),
        api_token: "admin-token".into(),
        // Unroutable on purpose: pipeline tests must not reach a real upstream.
        claude_api_url: "http://127.0.0.1:9".into(),
        claude_api_version: "2023-06-01".into(),
        claude_beta_header: "claude-code-20250219".into(),
        codex_api_url: "http://127.0.0.1:9".into(),
        session_binding_ttl_secs: 86_400,
        token_refresh_advance_secs: 60,
        error_pause_401_secs: 1800,
        error_pause_403_secs: 600,
        error_pause_429_secs: 300,
        error_pause_529_secs: 300,
        request_timeout_secs: 2,
        request_max_size_mb: 1,
        max_retry_accounts: 2,
        max_cache_controls: 4,
        log_level: "info".into(),
    }
}

fn build_pipeline(store: Arc<MemoryStore>) -> Arc<RelayPipeline> {
    let config = test_config();
    let cipher = Arc::new(Cipher::new(config.encryption_key.clone()));
    let transports = TransportManager::new(config.request_timeout());
    let tokens = TokenManager::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&transports),
        Arc::clone(&cipher),
        config.token_refresh_advance(),
    );
    let scheduler = Scheduler::new(Arc::clone(&store) as Arc<dyn Store>);
    let identity = IdentityTransformer::new(
        Arc::clone(&store) as Arc<dyn Store>,
        config.max_cache_controls,
        config.claude_api_version.clone(),
        config.claude_beta_header.clone(),
    );
    let ratelimit = RateLimitManager::new(
        Arc::clone(&store) as Arc<dyn Store>,
        ErrorPauses {
            on_401: config.error_pause(401),
            on_403: config.error_pause(403),
            on_429: config.error_pause(429),
            on_529: config.error_pause(529),
        },
        config.claude_api_url.clone(),
        config.codex_api_url.clone(),
    );
    RelayPipeline::new(
        store,
        scheduler,
        tokens,
        transports,
        identity,
        ratelimit,
        config,
    )
}

fn key() -> KeyInfo {
    KeyInfo { user_id: "u1".into(), name: "test".into(), bound_account_id: None }
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap_or_default();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

#[tokio::test]
async fn oversized_body_is_rejected_as_413() {
    let pipeline = build_pipeline(Arc::new(MemoryStore::ephemeral()));
    let raw = Bytes::from(vec![b'x'; 2 * 1024 * 1024]);

    let resp = pipeline.handle(&key(), Provider::Claude, raw, HeaderMap::new()).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["type"], "request_too_large");
}

#[tokio::test]
async fn invalid_json_is_rejected_as_400() {
    let pipeline = build_pipeline(Arc::new(MemoryStore::ephemeral()));
    let resp = pipeline
        .handle(&key(), Provider::Claude, Bytes::from_static(b"not json"), HeaderMap::new())
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn warmup_answers_locally_without_touching_accounts() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::ephemeral());
    let pipeline = build_pipeline(Arc::clone(&store));

    let raw = Bytes::from(
        json!({"model": "claude-3-5-haiku-20241022", "messages": [
            {"role": "user", "content": "Warmup"}
        ]})
        .to_string(),
    );
    let resp = pipeline.handle(&key(), Provider::Claude, raw, HeaderMap::new()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await?;
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("message_start"));
    assert!(text.contains("message_stop"));

    // No accounts exist, none were needed, and nothing was logged.
    assert!(store.logs_by_period(0, u64::MAX).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn no_accounts_yields_503_overloaded() {
    let pipeline = build_pipeline(Arc::new(MemoryStore::ephemeral()));
    let raw = Bytes::from(
        json!({"model": "claude-sonnet-4", "messages": [{"role": "user", "content": "hi"}]})
            .to_string(),
    );
    let resp = pipeline.handle(&key(), Provider::Claude, raw, HeaderMap::new()).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["type"], "overloaded_error");
    assert_eq!(body["error"]["message"], "no available accounts");
}

#[tokio::test]
async fn session_bound_to_sick_account_rejects_continuations() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::ephemeral());
    // Account A exists but is in error state.
    let mut row = crate::account::RowMap::new();
    row.insert("id".into(), "acct-a".into());
    row.insert("provider".into(), "claude".into());
    row.insert("status".into(), "error".into());
    row.insert("schedulable".into(), "false".into());
    store.set_account("acct-a", row).await?;

    let session = "9f2e1c44-0000-4000-8000-000000000001";
    store
        .set_session_binding(
            session,
            crate::store::SessionBinding {
                account_id: "acct-a".into(),
                created_at: epoch_ms(),
                last_used_at: epoch_ms(),
            },
            Duration::from_secs(3600),
        )
        .await?;

    let pipeline = build_pipeline(Arc::clone(&store));
    let user_id = format!("user_{}_account__session_{session}", "ab".repeat(32));
    let raw = Bytes::from(
        json!({
            "model": "claude-sonnet-4",
            "metadata": {"user_id": user_id},
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"}
            ]
        })
        .to_string(),
    );
    let resp = pipeline.handle(&key(), Provider::Claude, raw, HeaderMap::new()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["type"], "session_binding_error");

    // Nothing reached an account and nothing was logged.
    assert!(store.logs_by_period(0, u64::MAX).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn fresh_session_to_sick_account_reroutes_instead() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::ephemeral());
    let mut row = crate::account::RowMap::new();
    row.insert("id".into(), "acct-a".into());
    row.insert("provider".into(), "claude".into());
    row.insert("status".into(), "error".into());
    row.insert("schedulable".into(), "false".into());
    store.set_account("acct-a", row).await?;

    let session = "9f2e1c44-0000-4000-8000-000000000002";
    store
        .set_session_binding(
            session,
            crate::store::SessionBinding {
                account_id: "acct-a".into(),
                created_at: epoch_ms(),
                last_used_at: epoch_ms(),
            },
            Duration::from_secs(3600),
        )
        .await?;

    let pipeline = build_pipeline(Arc::clone(&store));
    let user_id = format!("user_{}_account__session_{session}", "ab".repeat(32));
    // Fresh session shape: one message, tools present.
    let raw = Bytes::from(
        json!({
            "model": "claude-sonnet-4",
            "metadata": {"user_id": user_id},
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "Bash"}]
        })
        .to_string(),
    );
    let resp = pipeline.handle(&key(), Provider::Claude, raw, HeaderMap::new()).await;
    // Not a session_binding_error; the pool is empty so it exhausts instead.
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}

// ── request-shape helpers ───────────────────────────────────────────────

#[test]
fn continuation_detection() {
    let multi = json!({"messages": [{"role": "user", "content": "a"}, {"role": "assistant", "content": "b"}]});
    assert!(is_continuation(&multi));

    let multi_block = json!({"messages": [{"role": "user", "content": [
        {"type": "text", "text": "a"}, {"type": "text", "text": "b"}
    ]}], "tools": [{"name": "X"}]});
    assert!(is_continuation(&multi_block));

    let no_tools = json!({"messages": [{"role": "user", "content": "a"}]});
    assert!(is_continuation(&no_tools), "fresh CLI sessions always carry tools");

    let fresh = json!({"messages": [{"role": "user", "content": "a"}], "tools": [{"name": "X"}]});
    assert!(!is_continuation(&fresh));
}

#[test]
fn session_uuid_extraction() {
    let body = json!({"metadata": {"user_id": format!(
        "user_{}_account__session_abc-123", "ab".repeat(32)
    )}});
    assert_eq!(extract_session_uuid(&body).as_deref(), Some("abc-123"));

    assert_eq!(extract_session_uuid(&json!({})), None);
    assert_eq!(extract_session_uuid(&json!({"metadata": {"user_id": "plain"}})), None);
}
