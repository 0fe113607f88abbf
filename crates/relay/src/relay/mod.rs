// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-request relay pipeline.
//!
//! One request flows: parse → warmup short-circuit → session binding →
//! retry loop (select account, ensure token, transform identity, dispatch,
//! forward). Retriable upstream statuses rotate to another account; success
//! updates account usage and the request log off the request path.

pub mod sse;
pub mod usage;
pub mod warmup;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::header::HeaderMap;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

use crate::account::{epoch_ms, Account, Provider};
use crate::config::RelayConfig;
use crate::error::{sanitize_upstream, RelayError, SanitizedError};
use crate::identity::{IdentityTransformer, TransformedRequest};
use crate::ratelimit::RateLimitManager;
use crate::scheduler::{Scheduler, SelectError, SelectOptions};
use crate::store::{RequestLog, SessionBinding, Store};
use crate::token::TokenManager;
use crate::transport::TransportManager;

/// Sticky-session fallback TTL (no session UUID in the request).
const STICKY_SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Extra same-account retries for transient 403s before rotating away.
const SAME_ACCOUNT_403_RETRIES: u32 = 2;

/// Authenticated principal attached by the auth middleware.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub user_id: String,
    pub name: String,
    /// Hard account binding carried by the API key; no fallback when set.
    pub bound_account_id: Option<String>,
}

pub struct RelayPipeline {
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    tokens: Arc<TokenManager>,
    transports: Arc<TransportManager>,
    identity: Arc<IdentityTransformer>,
    ratelimit: Arc<RateLimitManager>,
    config: RelayConfig,
    /// Opus spend per API key and ISO week, accumulated in-process.
    opus_weekly_cost: Arc<tokio::sync::Mutex<HashMap<String, f64>>>,
}

enum AttemptOutcome {
    /// Response handed to the client; the request is finished.
    Done(Response),
    /// This account failed retriably; move to the next one.
    Rotate { sanitized: SanitizedError },
}

impl RelayPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<Scheduler>,
        tokens: Arc<TokenManager>,
        transports: Arc<TransportManager>,
        identity: Arc<IdentityTransformer>,
        ratelimit: Arc<RateLimitManager>,
        config: RelayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            tokens,
            transports,
            identity,
            ratelimit,
            config,
            opus_weekly_cost: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        })
    }

    /// Relay one `/v1/messages` or `/openai/responses` request.
    pub async fn handle(
        &self,
        key: &KeyInfo,
        provider: Provider,
        raw_body: Bytes,
        client_headers: HeaderMap,
    ) -> Response {
        let started = Instant::now();

        if raw_body.len() > self.config.max_body_bytes() {
            return RelayError::RequestTooLarge
                .to_http_response(format!(
                    "request body exceeds {} MB",
                    self.config.request_max_size_mb
                ))
                .into_response();
        }
        let parsed: Value = match serde_json::from_slice(&raw_body) {
            Ok(v) => v,
            Err(e) => {
                return RelayError::InvalidRequest
                    .to_http_response(format!("request body is not valid JSON: {e}"))
                    .into_response()
            }
        };

        let model = parsed.get("model").and_then(Value::as_str).unwrap_or("").to_owned();
        let is_opus = model.to_lowercase().contains("opus");
        // Codex responses are always streamed back.
        let is_stream = provider == Provider::Codex
            || parsed.get("stream").and_then(Value::as_bool).unwrap_or(false);

        if provider == Provider::Claude && warmup::is_warmup(&parsed) {
            tracing::debug!(model, "answering warmup locally");
            return canned_warmup_response(&model);
        }

        // Session binding: a session UUID pins its account for the whole
        // conversation. Losing the account mid-session is surfaced, not
        // silently rerouted.
        let session_uuid = extract_session_uuid(&parsed);
        let mut preferred_account: Option<String> = None;
        if let Some(ref session) = session_uuid {
            match self.store.get_session_binding(session).await {
                Ok(Some(binding)) => {
                    let healthy = match self.store.get_account(&binding.account_id).await {
                        Ok(row) => Account::from_row(&row)
                            .is_some_and(|a| a.is_available(epoch_ms(), provider, is_opus)),
                        Err(_) => false,
                    };
                    if healthy {
                        preferred_account = Some(binding.account_id);
                    } else if is_continuation(&parsed) {
                        return RelayError::SessionBinding
                            .to_http_response(
                                "the account serving this session is unavailable; start a new session",
                            )
                            .into_response();
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(err = %e, "session binding lookup failed");
                }
            }
        } else if let Some(hash) = crate::identity::content_fingerprint(&parsed) {
            // Weaker content-derived stickiness when no session UUID exists.
            if let Ok(Some(account_id)) = self.store.get_sticky_session(&hash).await {
                preferred_account = Some(account_id);
            }
        }

        let max_attempts = self.config.max_retry_accounts + 1;
        let mut exclude: HashSet<String> = HashSet::new();
        let mut last_sanitized: Option<SanitizedError> = None;

        for attempt in 0..max_attempts {
            let account = match self
                .select_account(key, provider, is_opus, &mut preferred_account, &exclude)
                .await
            {
                Ok(account) => account,
                Err(resp) => {
                    // A previously captured upstream error is more useful
                    // than "no accounts" once we have actually tried one.
                    if let Some(ref sanitized) = last_sanitized {
                        return sanitized_response(sanitized);
                    }
                    return resp;
                }
            };

            if attempt > 0 {
                tracing::info!(
                    account_id = %account.id,
                    attempt = attempt + 1,
                    "retrying with different account"
                );
            }

            let access_token = match self.tokens.ensure_valid(&account.id).await {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!(account_id = %account.id, err = %e, "token unavailable, rotating");
                    if key.bound_account_id.is_some() {
                        return RelayError::Api
                            .to_http_response("bound account token unavailable")
                            .into_response();
                    }
                    exclude.insert(account.id.clone());
                    continue;
                }
            };

            match self
                .attempt_dispatch(
                    key,
                    provider,
                    &raw_body,
                    &client_headers,
                    &account,
                    &access_token,
                    &model,
                    is_opus,
                    is_stream,
                    session_uuid.as_deref(),
                    started,
                    attempt + 1 == max_attempts,
                )
                .await
            {
                Ok(AttemptOutcome::Done(response)) => return response,
                Ok(AttemptOutcome::Rotate { sanitized }) => {
                    last_sanitized = Some(sanitized);
                    if key.bound_account_id.is_some() {
                        // The binding is a contract: no rotation.
                        break;
                    }
                    exclude.insert(account.id.clone());
                }
                Err(e) => {
                    tracing::warn!(account_id = %account.id, err = %e, "dispatch failed, rotating");
                    if key.bound_account_id.is_some() {
                        break;
                    }
                    exclude.insert(account.id.clone());
                }
            }
        }

        match last_sanitized {
            Some(sanitized) => sanitized_response(&sanitized),
            None => RelayError::Overloaded
                .to_http_response("no available accounts")
                .into_response(),
        }
    }

    /// `/v1/messages/count_tokens` passthrough: same selection and identity
    /// handling, no retry rotation, plain JSON forward.
    pub async fn handle_count_tokens(
        &self,
        key: &KeyInfo,
        raw_body: Bytes,
        client_headers: HeaderMap,
    ) -> Response {
        let parsed: Value = match serde_json::from_slice(&raw_body) {
            Ok(v) => v,
            Err(e) => {
                return RelayError::InvalidRequest
                    .to_http_response(format!("request body is not valid JSON: {e}"))
                    .into_response()
            }
        };

        let mut preferred = None;
        let account = match self
            .select_account(key, Provider::Claude, false, &mut preferred, &HashSet::new())
            .await
        {
            Ok(account) => account,
            Err(resp) => return resp,
        };
        let access_token = match self.tokens.ensure_valid(&account.id).await {
            Ok(token) => token,
            Err(_) => {
                return RelayError::Api
                    .to_http_response("no usable token for token counting")
                    .into_response()
            }
        };
        let transformed =
            match self.identity.transform(parsed, &client_headers, &account, &access_token).await
            {
                Ok(t) => t,
                Err(e) => {
                    return RelayError::Api
                        .to_http_response(format!("request transformation failed: {e}"))
                        .into_response()
                }
            };

        let url = format!("{}/v1/messages/count_tokens", self.config.claude_api_url);
        match self.dispatch(&account, &url, &transformed).await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.bytes().await.unwrap_or_default();
                if (200..300).contains(&status) {
                    json_response(status, body)
                } else {
                    sanitized_response(&sanitize_upstream(
                        status,
                        &String::from_utf8_lossy(&body),
                    ))
                }
            }
            Err(e) => RelayError::Api
                .to_http_response(format!("upstream request failed: {e}"))
                .into_response(),
        }
    }

    /// Resolve the account for one attempt, turning selection failures into
    /// client responses.
    async fn select_account(
        &self,
        key: &KeyInfo,
        provider: Provider,
        is_opus: bool,
        preferred_account: &mut Option<String>,
        exclude: &HashSet<String>,
    ) -> Result<Account, Response> {
        // The session-preferred account is a soft first choice; drop it once
        // it has been tried or became unavailable.
        let soft = preferred_account.take().filter(|id| !exclude.contains(id));

        let opts = SelectOptions {
            bound_account_id: key.bound_account_id.clone().or(soft.clone()),
            is_opus,
            exclude: exclude.clone(),
        };
        match self.scheduler.select(provider, &opts).await {
            Ok(account) => Ok(account),
            Err(SelectError::BoundUnavailable { account_id, reason })
                if key.bound_account_id.is_none() && soft.is_some() =>
            {
                tracing::debug!(account_id, reason, "session-preferred account unusable");
                let fallback = SelectOptions {
                    bound_account_id: None,
                    is_opus,
                    exclude: exclude.clone(),
                };
                self.scheduler
                    .select(provider, &fallback)
                    .await
                    .map_err(|e| select_error_response(e))
            }
            Err(e) => Err(select_error_response(e)),
        }
    }

    /// One account's attempt: transform, dispatch (with same-account 403
    /// retries), and forward or hand back a rotate decision.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_dispatch(
        &self,
        key: &KeyInfo,
        provider: Provider,
        raw_body: &Bytes,
        client_headers: &HeaderMap,
        account: &Account,
        access_token: &str,
        model: &str,
        is_opus: bool,
        is_stream: bool,
        session_uuid: Option<&str>,
        started: Instant,
        last_attempt: bool,
    ) -> anyhow::Result<AttemptOutcome> {
        let mut retries_403 = 0u32;
        loop {
            // Fresh parse per try: transformation mutates the tree.
            let parsed: Value = serde_json::from_slice(raw_body)?;
            let transformed =
                self.identity.transform(parsed, client_headers, account, access_token).await?;

            let url = match provider {
                Provider::Claude => format!("{}/v1/messages", self.config.claude_api_url),
                Provider::Codex => format!("{}/codex/responses", self.config.codex_api_url),
            };
            let resp = self.dispatch(account, &url, &transformed).await?;
            let status = resp.status().as_u16();
            let resp_headers: HeaderMap = resp.headers().clone();

            if let Err(e) =
                self.ratelimit.capture_headers(&account.id, provider, &resp_headers).await
            {
                tracing::warn!(account_id = %account.id, err = %e, "failed to capture rate-limit headers");
            }

            if (200..300).contains(&status) {
                if let (Some(session), true) = (session_uuid, !transformed.session_hash.is_empty())
                {
                    self.bind_session(session, &account.id).await;
                } else if !transformed.session_hash.is_empty() {
                    let _ = self
                        .store
                        .set_sticky_session(
                            &transformed.session_hash,
                            &account.id,
                            STICKY_SESSION_TTL,
                        )
                        .await;
                }

                let response = if is_stream {
                    self.forward_stream(resp, key, account, model, started).await
                } else {
                    self.forward_json(resp, key, account, model, started).await
                };
                return Ok(AttemptOutcome::Done(response));
            }

            let body_text = resp.text().await.unwrap_or_default();

            if matches!(status, 401 | 403 | 429 | 529) {
                if status == 403
                    && retries_403 < SAME_ACCOUNT_403_RETRIES
                    && !crate::ratelimit::is_ban_signal(&body_text)
                {
                    // Warm accounts sometimes throw a transient 403; retry
                    // in place before paying for a rotation.
                    retries_403 += 1;
                    tracing::debug!(account_id = %account.id, retries_403, "transient 403, retrying same account");
                    continue;
                }
                if let Err(e) = self
                    .ratelimit
                    .on_retriable_status(
                        account,
                        status,
                        &body_text,
                        is_opus,
                        &resp_headers,
                        &self.tokens,
                    )
                    .await
                {
                    tracing::warn!(account_id = %account.id, err = %e, "rate-limit side effects failed");
                }
                let sanitized = sanitize_upstream(status, &body_text);
                if last_attempt {
                    return Ok(AttemptOutcome::Done(sanitized_response(&sanitized)));
                }
                return Ok(AttemptOutcome::Rotate { sanitized });
            }

            // Non-retriable upstream error: sanitize and surface.
            return Ok(AttemptOutcome::Done(sanitized_response(&sanitize_upstream(
                status, &body_text,
            ))));
        }
    }

    async fn dispatch(
        &self,
        account: &Account,
        url: &str,
        transformed: &TransformedRequest,
    ) -> anyhow::Result<reqwest::Response> {
        let client = self.transports.client_for(account.proxy.as_ref()).await?;
        let mut req = client
            .post(url)
            .headers(transformed.headers.clone())
            .body(serde_json::to_vec(&transformed.body)?);
        if account.provider == Provider::Codex {
            req = req.header("Host", "chatgpt.com");
            if let Some(chatgpt_id) = account.chatgpt_account_id() {
                req = req.header("Chatgpt-Account-Id", chatgpt_id);
            }
        }
        Ok(req.send().await?)
    }

    async fn bind_session(&self, session: &str, account_id: &str) {
        let now = epoch_ms();
        let ttl = self.config.session_binding_ttl();
        let existing = self.store.get_session_binding(session).await.ok().flatten();
        let result = match existing {
            Some(_) => self.store.renew_session_binding(session, ttl).await,
            None => {
                let binding = SessionBinding {
                    account_id: account_id.to_owned(),
                    created_at: now,
                    last_used_at: now,
                };
                self.store.set_session_binding(session, binding, ttl).await
            }
        };
        if let Err(e) = result {
            tracing::warn!(session, err = %e, "failed to persist session binding");
        }
    }

    /// Stream the upstream SSE body to the client, scanning usage as it
    /// passes. Post-success accounting runs only for streams that reached
    /// their terminal event; a client disconnect mid-stream records nothing.
    async fn forward_stream(
        &self,
        resp: reqwest::Response,
        key: &KeyInfo,
        account: &Account,
        model: &str,
        started: Instant,
    ) -> Response {
        let status = resp.status().as_u16();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

        let store = Arc::clone(&self.store);
        let key = key.clone();
        let account_id = account.id.clone();
        let fallback_model = model.to_owned();
        let opus_costs = self.opus_costs_handle();

        tokio::spawn(async move {
            let mut upstream = resp.bytes_stream();
            let mut lines = sse::LineBuffer::new();
            let mut scanner = sse::SseScanner::new();
            let mut client_gone = false;

            'read: while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::debug!(err = %e, "upstream stream ended with error");
                        // The stream already started; the only channel left
                        // is an SSE error event.
                        let event = sanitize_upstream(502, "").to_sse_event();
                        let _ = tx.send(Ok(Bytes::from(event))).await;
                        break;
                    }
                };
                let complete_lines = match lines.push(&chunk) {
                    Ok(lines) => lines,
                    Err(e) => {
                        tracing::warn!(err = %e, "oversized SSE line, aborting stream");
                        let event = sanitize_upstream(500, "").to_sse_event();
                        let _ = tx.send(Ok(Bytes::from(event))).await;
                        break;
                    }
                };
                for line in complete_lines {
                    scanner.feed_line(String::from_utf8_lossy(&line).trim_end());
                    if tx.send(Ok(Bytes::from(line))).await.is_err() {
                        client_gone = true;
                        break 'read;
                    }
                }
            }
            if !client_gone {
                if let Some(rest) = lines.remainder() {
                    scanner.feed_line(String::from_utf8_lossy(&rest).trim_end());
                    let _ = tx.send(Ok(Bytes::from(rest))).await;
                }
            }

            if scanner.completed {
                let model = if scanner.model.is_empty() {
                    fallback_model
                } else {
                    scanner.model.clone()
                };
                record_success(
                    store,
                    opus_costs,
                    key,
                    account_id,
                    model,
                    scanner.usage,
                    status,
                    started.elapsed().as_millis() as u64,
                );
            } else {
                tracing::debug!(account_id, "partial stream, skipping usage accounting");
            }
        });

        let mut builder = Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("x-accel-buffering", "no");
        if let Some(headers) = builder.headers_mut() {
            headers.insert("connection", axum::http::HeaderValue::from_static("keep-alive"));
        }
        builder
            .body(Body::from_stream(ReceiverStream::new(rx)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    async fn forward_json(
        &self,
        resp: reqwest::Response,
        key: &KeyInfo,
        account: &Account,
        model: &str,
        started: Instant,
    ) -> Response {
        let status = resp.status().as_u16();
        let body = resp.bytes().await.unwrap_or_default();

        let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let observed = usage::usage_from_json(&parsed);
        let model = parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_owned();

        record_success(
            Arc::clone(&self.store),
            self.opus_costs_handle(),
            key.clone(),
            account.id.clone(),
            model,
            observed,
            status,
            started.elapsed().as_millis() as u64,
        );

        json_response(status, body)
    }

    fn opus_costs_handle(&self) -> Arc<tokio::sync::Mutex<HashMap<String, f64>>> {
        Arc::clone(&self.opus_weekly_cost)
    }

    /// Total Opus spend recorded for an API key in the current ISO week.
    pub async fn opus_weekly_spend(&self, user_id: &str) -> f64 {
        let costs = self.opus_weekly_cost.lock().await;
        costs.get(&opus_week_key(user_id)).copied().unwrap_or(0.0)
    }
}

fn opus_week_key(user_id: &str) -> String {
    let week = chrono::Utc::now().format("%G-W%V");
    format!("{user_id}:{week}")
}

/// Fire-and-forget post-success accounting: `lastUsedAt`, request log, and
/// the Opus weekly spend counter. Runs detached so a client disconnect after
/// completion cannot cancel it.
#[allow(clippy::too_many_arguments)]
fn record_success(
    store: Arc<dyn Store>,
    opus_costs: Arc<tokio::sync::Mutex<HashMap<String, f64>>>,
    key: KeyInfo,
    account_id: String,
    model: String,
    observed: usage::Usage,
    status: u16,
    duration_ms: u64,
) {
    tokio::spawn(async move {
        let now = epoch_ms();
        let mut fields = crate::account::RowMap::new();
        fields.insert("lastUsedAt".into(), now.to_string());
        if let Err(e) = store.update_account(&account_id, fields).await {
            tracing::warn!(account_id, err = %e, "failed to update lastUsedAt");
        }

        let cost = usage::cost_usd(&model, &observed);
        let log = RequestLog {
            user_id: key.user_id.clone(),
            account_id: account_id.clone(),
            model: model.clone(),
            input_tokens: observed.input_tokens,
            output_tokens: observed.output_tokens,
            cache_read_tokens: observed.cache_read_tokens,
            cache_create_tokens: observed.cache_create_tokens,
            cost_usd: cost,
            status,
            duration_ms,
            created_at: now,
        };
        if let Err(e) = store.insert_request_log(log).await {
            tracing::warn!(account_id, err = %e, "failed to insert request log");
        }

        if model.to_lowercase().contains("opus") {
            let mut costs = opus_costs.lock().await;
            *costs.entry(opus_week_key(&key.user_id)).or_insert(0.0) += cost;
        }
    });
}

fn select_error_response(e: SelectError) -> Response {
    match e {
        SelectError::BoundUnavailable { account_id, reason } => RelayError::Overloaded
            .to_http_response(format!("bound account {account_id} unavailable: {reason}"))
            .into_response(),
        SelectError::NoAvailableAccounts => {
            RelayError::Overloaded.to_http_response("no available accounts").into_response()
        }
        SelectError::Store(e) => {
            RelayError::Api.to_http_response(format!("store error: {e}")).into_response()
        }
    }
}

fn sanitized_response(sanitized: &SanitizedError) -> Response {
    let status =
        StatusCode::from_u16(sanitized.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(sanitized.body.clone())).into_response()
}

fn json_response(status: u16, body: Bytes) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The canned warmup answer: a fixed SSE sequence with a real-looking cadence.
fn canned_warmup_response(model: &str) -> Response {
    let events = warmup::canned_events(model);
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        for event in events {
            if tx.send(Ok(Bytes::from(event))).await.is_err() {
                return;
            }
            tokio::time::sleep(warmup::EVENT_DELAY).await;
        }
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The session UUID is the tail of the client's original `metadata.user_id`.
fn extract_session_uuid(body: &Value) -> Option<String> {
    let user_id = body.get("metadata")?.get("user_id")?.as_str()?;
    let tail = user_id.split("session_").nth(1)?;
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_owned())
    }
}

/// A continuation carries conversation history: more than one message, a
/// single message with multiple text blocks, or a single message without the
/// tool definitions every fresh CLI session sends.
fn is_continuation(body: &Value) -> bool {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return false;
    };
    if messages.len() > 1 {
        return true;
    }
    let Some(first) = messages.first() else {
        return false;
    };
    if let Some(blocks) = first.get("content").and_then(Value::as_array) {
        let text_blocks = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .count();
        if text_blocks > 1 {
            return true;
        }
    }
    body.get("tools").and_then(Value::as_array).is_none()
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
