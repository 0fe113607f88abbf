// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process store with a durable JSON snapshot.
//!
//! Accounts, users, and request logs survive restarts via an atomic
//! write-tmp-then-rename snapshot at the configured path. The ephemeral
//! collections are plain [`TtlMap`]s and start empty on boot.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::account::RowMap;
use crate::store::ttl::TtlMap;
use crate::store::{OauthHandshake, RequestLog, SessionBinding, Store};

/// Durable snapshot written to `DB_PATH`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    accounts: HashMap<String, RowMap>,
    #[serde(default)]
    users: HashMap<String, RowMap>,
    #[serde(default)]
    request_logs: Vec<RequestLog>,
}

pub struct MemoryStore {
    accounts: RwLock<HashMap<String, RowMap>>,
    users: RwLock<HashMap<String, RowMap>>,
    request_logs: RwLock<Vec<RequestLog>>,

    session_bindings: TtlMap<SessionBinding>,
    sticky_sessions: TtlMap<String>,
    stainless_fingerprints: TtlMap<String>,
    oauth_handshakes: TtlMap<OauthHandshake>,
    refresh_locks: std::sync::Mutex<HashSet<String>>,

    /// `None` disables durability (tests).
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Open the store, loading an existing snapshot when present.
    pub fn open(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let snapshot = match &path {
            Some(p) if p.exists() => {
                let contents = std::fs::read_to_string(p)?;
                serde_json::from_str(&contents)?
            }
            _ => Snapshot::default(),
        };

        Ok(Self {
            accounts: RwLock::new(snapshot.accounts),
            users: RwLock::new(snapshot.users),
            request_logs: RwLock::new(snapshot.request_logs),
            session_bindings: TtlMap::new(),
            sticky_sessions: TtlMap::new(),
            stainless_fingerprints: TtlMap::new(),
            oauth_handshakes: TtlMap::new(),
            refresh_locks: std::sync::Mutex::new(HashSet::new()),
            path,
        })
    }

    /// Ephemeral store for tests: no snapshot file.
    pub fn ephemeral() -> Self {
        // open() without a path cannot fail.
        Self::open(None).unwrap_or_else(|_| Self {
            accounts: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            request_logs: RwLock::new(Vec::new()),
            session_bindings: TtlMap::new(),
            sticky_sessions: TtlMap::new(),
            stainless_fingerprints: TtlMap::new(),
            oauth_handshakes: TtlMap::new(),
            refresh_locks: std::sync::Mutex::new(HashSet::new()),
            path: None,
        })
    }

    /// Write the snapshot atomically (tmp + rename).
    async fn persist(&self) -> anyhow::Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let snapshot = Snapshot {
            accounts: self.accounts.read().await.clone(),
            users: self.users.read().await.clone(),
            request_logs: self.request_logs.read().await.clone(),
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Drop expired entries from every ephemeral collection.
    pub async fn sweep_ephemeral(&self) {
        self.session_bindings.sweep().await;
        self.sticky_sessions.sweep().await;
        self.oauth_handshakes.sweep().await;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_account(&self, id: &str) -> anyhow::Result<RowMap> {
        Ok(self.accounts.read().await.get(id).cloned().unwrap_or_default())
    }

    async fn set_account(&self, id: &str, row: RowMap) -> anyhow::Result<()> {
        self.accounts.write().await.insert(id.to_owned(), row);
        self.persist().await
    }

    async fn update_account(&self, id: &str, fields: RowMap) -> anyhow::Result<()> {
        {
            let mut accounts = self.accounts.write().await;
            let row = accounts.entry(id.to_owned()).or_default();
            for (key, value) in fields {
                row.insert(key, value);
            }
        }
        self.persist().await
    }

    async fn delete_account(&self, id: &str) -> anyhow::Result<()> {
        self.accounts.write().await.remove(id);
        self.stainless_fingerprints.remove(id).await;
        self.persist().await
    }

    async fn list_account_ids(&self) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_user(&self, id: &str) -> anyhow::Result<RowMap> {
        Ok(self.users.read().await.get(id).cloned().unwrap_or_default())
    }

    async fn find_user_by_token_hash(&self, token_hash: &str) -> anyhow::Result<RowMap> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|row| row.get("tokenHash").map(String::as_str) == Some(token_hash))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_user(&self, id: &str, row: RowMap) -> anyhow::Result<()> {
        self.users.write().await.insert(id.to_owned(), row);
        self.persist().await
    }

    async fn update_user(&self, id: &str, fields: RowMap) -> anyhow::Result<()> {
        {
            let mut users = self.users.write().await;
            let row = users.entry(id.to_owned()).or_default();
            for (key, value) in fields {
                row.insert(key, value);
            }
        }
        self.persist().await
    }

    async fn delete_user(&self, id: &str) -> anyhow::Result<()> {
        self.users.write().await.remove(id);
        self.persist().await
    }

    async fn list_user_ids(&self) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self.users.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_session_binding(
        &self,
        session: &str,
    ) -> anyhow::Result<Option<SessionBinding>> {
        Ok(self.session_bindings.get(session).await)
    }

    async fn set_session_binding(
        &self,
        session: &str,
        binding: SessionBinding,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        self.session_bindings.insert(session, binding, Some(ttl)).await;
        Ok(())
    }

    async fn renew_session_binding(&self, session: &str, ttl: Duration) -> anyhow::Result<()> {
        self.session_bindings.extend(session, ttl).await;
        Ok(())
    }

    async fn get_sticky_session(&self, fingerprint: &str) -> anyhow::Result<Option<String>> {
        Ok(self.sticky_sessions.get(fingerprint).await)
    }

    async fn set_sticky_session(
        &self,
        fingerprint: &str,
        account_id: &str,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        self.sticky_sessions.insert(fingerprint, account_id.to_owned(), Some(ttl)).await;
        Ok(())
    }

    async fn get_stainless_fingerprint(
        &self,
        account_id: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(self.stainless_fingerprints.get(account_id).await)
    }

    async fn set_stainless_fingerprint_nx(
        &self,
        account_id: &str,
        fingerprint_json: &str,
    ) -> anyhow::Result<bool> {
        Ok(self
            .stainless_fingerprints
            .insert_nx(account_id, fingerprint_json.to_owned(), None)
            .await)
    }

    async fn put_oauth_handshake(
        &self,
        session_id: &str,
        handshake: OauthHandshake,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        self.oauth_handshakes.insert(session_id, handshake, Some(ttl)).await;
        Ok(())
    }

    async fn take_oauth_handshake(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Option<OauthHandshake>> {
        Ok(self.oauth_handshakes.take(session_id).await)
    }

    async fn acquire_refresh_lock(&self, account_id: &str) -> anyhow::Result<bool> {
        let mut locks = self
            .refresh_locks
            .lock()
            .map_err(|_| anyhow::anyhow!("refresh lock set poisoned"))?;
        Ok(locks.insert(account_id.to_owned()))
    }

    async fn release_refresh_lock(&self, account_id: &str) -> anyhow::Result<()> {
        let mut locks = self
            .refresh_locks
            .lock()
            .map_err(|_| anyhow::anyhow!("refresh lock set poisoned"))?;
        locks.remove(account_id);
        Ok(())
    }

    async fn insert_request_log(&self, log: RequestLog) -> anyhow::Result<()> {
        self.request_logs.write().await.push(log);
        self.persist().await
    }

    async fn logs_by_period(
        &self,
        since_ms: u64,
        until_ms: u64,
    ) -> anyhow::Result<Vec<RequestLog>> {
        Ok(self
            .request_logs
            .read()
            .await
            .iter()
            .filter(|l| l.created_at >= since_ms && l.created_at < until_ms)
            .cloned()
            .collect())
    }

    async fn logs_by_account(
        &self,
        account_id: &str,
        since_ms: u64,
    ) -> anyhow::Result<Vec<RequestLog>> {
        Ok(self
            .request_logs
            .read()
            .await
            .iter()
            .filter(|l| l.account_id == account_id && l.created_at >= since_ms)
            .cloned()
            .collect())
    }

    async fn logs_by_user(
        &self,
        user_id: &str,
        since_ms: u64,
    ) -> anyhow::Result<Vec<RequestLog>> {
        Ok(self
            .request_logs
            .read()
            .await
            .iter()
            .filter(|l| l.user_id == user_id && l.created_at >= since_ms)
            .cloned()
            .collect())
    }

    async fn purge_logs_before(&self, cutoff_ms: u64) -> anyhow::Result<u64> {
        let removed = {
            let mut logs = self.request_logs.write().await;
            let before = logs.len();
            logs.retain(|l| l.created_at >= cutoff_ms);
            (before - logs.len()) as u64
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
