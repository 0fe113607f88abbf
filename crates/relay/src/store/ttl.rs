// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Expiring key-value map backing the store's ephemeral collections.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    /// `None` means no expiry (stainless fingerprints).
    deadline: Option<Instant>,
}

impl<V> Entry<V> {
    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// String-keyed map with per-entry TTLs. Expired entries are dropped lazily
/// on access and in bulk by [`TtlMap::sweep`].
pub struct TtlMap<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlMap<V> {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it under the write lock.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
        }
        None
    }

    pub async fn insert(&self, key: &str, value: V, ttl: Option<Duration>) {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .await
            .insert(key.to_owned(), Entry { value, deadline });
    }

    /// Store only if no live entry exists. Returns `true` when this call won.
    pub async fn insert_nx(&self, key: &str, value: V, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.expired(now)) {
            return false;
        }
        let deadline = ttl.map(|ttl| now + ttl);
        entries.insert(key.to_owned(), Entry { value, deadline });
        true
    }

    /// Push an existing entry's deadline out to `now + ttl`.
    pub async fn extend(&self, key: &str, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if !entry.expired(now) {
                entry.deadline = Some(now + ttl);
            }
        }
    }

    /// Remove and return a live entry.
    pub async fn take(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.remove(key) {
            Some(entry) if !entry.expired(now) => Some(entry.value),
            _ => None,
        }
    }

    pub async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Drop every expired entry.
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.entries.write().await.retain(|_, e| !e.expired(now));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl<V: Clone> Default for TtlMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "ttl_tests.rs"]
mod tests;
