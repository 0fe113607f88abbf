// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth access-token lifecycle with per-account single-flight refresh.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::account::{epoch_ms, Account, Provider, RowMap};
use crate::crypto::{Cipher, TOKEN_SALT};
use crate::store::Store;
use crate::transport::TransportManager;

/// Standard OAuth2 token response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// OAuth token endpoint for a provider.
pub fn provider_token_url(provider: Provider) -> &'static str {
    match provider {
        Provider::Claude => "https://console.anthropic.com/v1/oauth/token",
        Provider::Codex => "https://auth.openai.com/oauth/token",
    }
}

/// Public OAuth client id the CLI tooling registers under.
pub fn provider_client_id(provider: Provider) -> &'static str {
    match provider {
        Provider::Claude => "9d1c250a-e61b-44d9-88ed-5944d1962f5e",
        Provider::Codex => "app_EMoamEEZ73f0CkXaXp7hrann",
    }
}

/// How long the loser of the refresh lock waits before re-reading the row.
const LOSER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Keeps account access tokens fresh. Refreshes lazily, inside a 60 s
/// pre-expiry window, with one in-flight refresh per account.
pub struct TokenManager {
    store: Arc<dyn Store>,
    transports: Arc<TransportManager>,
    cipher: Arc<Cipher>,
    refresh_advance: Duration,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn Store>,
        transports: Arc<TransportManager>,
        cipher: Arc<Cipher>,
        refresh_advance: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { store, transports, cipher, refresh_advance })
    }

    /// Return a valid plaintext access token for the account, refreshing if
    /// it is inside the pre-expiry window.
    pub async fn ensure_valid(&self, account_id: &str) -> anyhow::Result<String> {
        let account = self.load(account_id).await?;
        if let Some(token) = self.cached_token(&account)? {
            return Ok(token);
        }
        self.refresh(account_id).await
    }

    /// Refresh unconditionally, bypassing the cached token. Used when the
    /// upstream rejected the current token with a 401.
    pub async fn force_refresh(&self, account_id: &str) -> anyhow::Result<String> {
        self.refresh(account_id).await
    }

    async fn load(&self, account_id: &str) -> anyhow::Result<Account> {
        let row = self.store.get_account(account_id).await?;
        Account::from_row(&row)
            .ok_or_else(|| anyhow::anyhow!("unknown account: {account_id}"))
    }

    /// The stored token, if it is still comfortably valid.
    fn cached_token(&self, account: &Account) -> anyhow::Result<Option<String>> {
        let advance_ms = self.refresh_advance.as_millis() as u64;
        if account.access_token.is_empty() || account.expires_at == 0 {
            return Ok(None);
        }
        if epoch_ms() >= account.expires_at.saturating_sub(advance_ms) {
            return Ok(None);
        }
        Ok(Some(self.cipher.decrypt(&account.access_token, TOKEN_SALT)?))
    }

    async fn refresh(&self, account_id: &str) -> anyhow::Result<String> {
        if !self.store.acquire_refresh_lock(account_id).await? {
            // Another request holds the refresh; give it a moment and reuse
            // its result rather than queueing.
            tokio::time::sleep(LOSER_RETRY_DELAY).await;
            let account = self.load(account_id).await?;
            if let Some(token) = self.cached_token(&account)? {
                return Ok(token);
            }
            anyhow::bail!("token refresh in progress elsewhere for {account_id}");
        }

        let result = self.refresh_locked(account_id).await;
        if let Err(e) = self.store.release_refresh_lock(account_id).await {
            tracing::warn!(account_id, err = %e, "failed to release refresh lock");
        }
        result
    }

    async fn refresh_locked(&self, account_id: &str) -> anyhow::Result<String> {
        let account = self.load(account_id).await?;
        match self.do_refresh(&account).await {
            Ok(token) => {
                tracing::info!(account_id, "access token refreshed");
                Ok(token)
            }
            Err(e) => {
                let message = truncate_error(&e.to_string(), 200);
                let mut fields = RowMap::new();
                fields.insert("status".into(), "error".into());
                fields.insert("errorMessage".into(), message);
                if let Err(se) = self.store.update_account(account_id, fields).await {
                    tracing::warn!(account_id, err = %se, "failed to record refresh failure");
                }
                tracing::warn!(account_id, err = %e, "token refresh failed");
                Err(e)
            }
        }
    }

    async fn do_refresh(&self, account: &Account) -> anyhow::Result<String> {
        if account.refresh_token.is_empty() {
            anyhow::bail!("account {} has no refresh token", account.id);
        }
        let refresh_token = self.cipher.decrypt(&account.refresh_token, TOKEN_SALT)?;

        // Route the refresh through the account's own transport so the token
        // endpoint sees the same exit IP as relay traffic.
        let client = self.transports.client_for(account.proxy.as_ref()).await?;
        let resp = client
            .post(provider_token_url(account.provider))
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", provider_client_id(account.provider)),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("refresh failed ({status}): {text}");
        }
        let token: TokenResponse = resp.json().await?;

        let now = epoch_ms();
        let mut fields = RowMap::new();
        fields.insert("accessToken".into(), self.cipher.encrypt(&token.access_token, TOKEN_SALT)?);
        if let Some(ref new_refresh) = token.refresh_token {
            fields.insert("refreshToken".into(), self.cipher.encrypt(new_refresh, TOKEN_SALT)?);
        }
        fields.insert("expiresAt".into(), (now + token.expires_in * 1000).to_string());
        fields.insert("status".into(), "active".into());
        fields.insert("schedulable".into(), "true".into());
        fields.insert("overloadedAt".into(), String::new());
        fields.insert("overloadedUntil".into(), String::new());
        fields.insert("lastRefreshAt".into(), now.to_string());
        fields.insert("errorMessage".into(), String::new());
        self.store.update_account(&account.id, fields).await?;

        Ok(token.access_token)
    }
}

fn truncate_error(message: &str, max_chars: usize) -> String {
    message.chars().take(max_chars).collect()
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
