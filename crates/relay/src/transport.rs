// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-account HTTP client pool.
//!
//! One reusable client exists per distinct connection configuration — the
//! account's proxy, or "direct". Every client presents the same Chrome
//! browser identity upstream: Chrome user agent and client-hint headers,
//! rustls with full certificate verification, TLS 1.2+, HTTP/2 ALPN. Token
//! refresh goes through the same client as relay traffic so an account's
//! requests always leave from one network path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::account::ProxyConfig;

/// Chrome identity presented upstream.
const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const CHROME_SEC_CH_UA: &str =
    "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"";

/// Pool entries untouched for this long are evicted.
const IDLE_EVICTION: Duration = Duration::from_secs(300);
/// How often the eviction sweep runs.
const EVICTION_SWEEP: Duration = Duration::from_secs(60);

struct PoolEntry {
    client: reqwest::Client,
    last_used: Instant,
}

/// Pool of reusable upstream HTTP clients keyed by connection configuration.
pub struct TransportManager {
    clients: Mutex<IndexMap<String, PoolEntry>>,
    timeout: Duration,
}

impl TransportManager {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self { clients: Mutex::new(IndexMap::new()), timeout })
    }

    /// Fetch (or build) the client for the given proxy configuration.
    pub async fn client_for(
        &self,
        proxy: Option<&ProxyConfig>,
    ) -> anyhow::Result<reqwest::Client> {
        let key = proxy.map(ProxyConfig::pool_key).unwrap_or_else(|| "direct".to_owned());

        let mut clients = self.clients.lock().await;
        if let Some(entry) = clients.get_mut(&key) {
            entry.last_used = Instant::now();
            return Ok(entry.client.clone());
        }

        let client = build_client(proxy, self.timeout)?;
        clients.insert(key, PoolEntry { client: client.clone(), last_used: Instant::now() });
        Ok(client)
    }

    /// Drop entries idle longer than `max_idle`; returns how many went.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, entry| now.duration_since(entry.last_used) < max_idle);
        before - clients.len()
    }

    pub async fn pool_size(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Spawn the periodic idle-eviction sweep.
    pub fn spawn_eviction_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(EVICTION_SWEEP);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }
                let evicted = pool.evict_idle(IDLE_EVICTION).await;
                if evicted > 0 {
                    tracing::debug!(evicted, "transport pool: evicted idle clients");
                }
            }
        });
    }
}

fn chrome_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("accept-language", HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert("sec-ch-ua", HeaderValue::from_static(CHROME_SEC_CH_UA));
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"macOS\""));
    headers
}

fn build_client(proxy: Option<&ProxyConfig>, timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .user_agent(CHROME_USER_AGENT)
        .default_headers(chrome_headers())
        .use_rustls_tls()
        .min_tls_version(reqwest::tls::Version::TLS_1_2);

    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy.url())?);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
