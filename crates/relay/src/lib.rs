// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ccrelay: multi-account reverse-proxy relay for LLM coding CLIs.

pub mod account;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod identity;
pub mod oauth;
pub mod ratelimit;
pub mod relay;
pub mod scheduler;
pub mod store;
pub mod token;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::crypto::Cipher;
use crate::http::{build_router, AppState};
use crate::identity::IdentityTransformer;
use crate::ratelimit::{ErrorPauses, RateLimitManager};
use crate::relay::RelayPipeline;
use crate::scheduler::Scheduler;
use crate::store::memory::MemoryStore;
use crate::store::Store;
use crate::token::TokenManager;
use crate::transport::TransportManager;

/// Request logs are kept this long.
const LOG_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);
/// How often the log purge and ephemeral sweep run.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Run the relay server until shutdown.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let cipher = Arc::new(Cipher::new(config.encryption_key.clone()));
    // Key derivation happens on first use; fail here, not mid-request.
    cipher.encrypt("startup-probe", crypto::TOKEN_SALT)?;

    let memory_store = Arc::new(MemoryStore::open(Some(config.db_path.clone()))?);
    let store: Arc<dyn Store> = Arc::clone(&memory_store) as Arc<dyn Store>;

    let transports = TransportManager::new(config.request_timeout());
    transports.spawn_eviction_loop(shutdown.clone());

    let tokens = TokenManager::new(
        Arc::clone(&store),
        Arc::clone(&transports),
        Arc::clone(&cipher),
        config.token_refresh_advance(),
    );
    let scheduler = Scheduler::new(Arc::clone(&store));
    let identity = IdentityTransformer::new(
        Arc::clone(&store),
        config.max_cache_controls,
        config.claude_api_version.clone(),
        config.claude_beta_header.clone(),
    );
    let ratelimit = RateLimitManager::new(
        Arc::clone(&store),
        ErrorPauses {
            on_401: config.error_pause(401),
            on_403: config.error_pause(403),
            on_429: config.error_pause(429),
            on_529: config.error_pause(529),
        },
        config.claude_api_url.clone(),
        config.codex_api_url.clone(),
    );
    ratelimit.spawn_cleanup_loop(shutdown.clone());
    ratelimit.spawn_reprobe_loop(
        Arc::clone(&tokens),
        Arc::clone(&transports),
        shutdown.clone(),
    );

    spawn_maintenance_loop(Arc::clone(&memory_store), shutdown.clone());

    let pipeline = RelayPipeline::new(
        Arc::clone(&store),
        scheduler,
        tokens,
        Arc::clone(&transports),
        identity,
        ratelimit,
        config.clone(),
    );

    let state = Arc::new(AppState {
        store,
        pipeline,
        cipher,
        transports,
        config: config.clone(),
    });

    // Ctrl-C triggers a graceful drain.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    tracing::info!("ccrelay listening on {addr}");
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

/// Hourly upkeep: purge request logs past retention, sweep expired
/// ephemeral entries.
fn spawn_maintenance_loop(store: Arc<MemoryStore>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(MAINTENANCE_INTERVAL);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let cutoff = crate::account::epoch_ms()
                .saturating_sub(LOG_RETENTION.as_millis() as u64);
            match store.purge_logs_before(cutoff).await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "purged expired request logs"),
                Err(e) => tracing::warn!(err = %e, "request log purge failed"),
            }
            store.sweep_ephemeral().await;
        }
    });
}
