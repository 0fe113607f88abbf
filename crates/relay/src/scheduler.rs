// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Account selection for one relay request.

use std::collections::HashSet;
use std::sync::Arc;

use crate::account::{epoch_ms, Account, Provider};
use crate::store::Store;

/// Inputs to one selection.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Account the API key (or session binding) pins this request to.
    pub bound_account_id: Option<String>,
    pub is_opus: bool,
    /// Accounts already tried in this request.
    pub exclude: HashSet<String>,
}

/// Why selection failed.
#[derive(Debug)]
pub enum SelectError {
    /// The bound account exists but cannot serve the request. No fallback —
    /// the binding is a contract.
    BoundUnavailable { account_id: String, reason: String },
    /// The pool has no account that can serve this request.
    NoAvailableAccounts,
    Store(anyhow::Error),
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BoundUnavailable { account_id, reason } => {
                write!(f, "bound account {account_id} unavailable: {reason}")
            }
            Self::NoAvailableAccounts => f.write_str("no available accounts"),
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for SelectError {}

pub struct Scheduler {
    store: Arc<dyn Store>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Pick one schedulable account for a request.
    ///
    /// A bound account is honored or the request fails; otherwise candidates
    /// are filtered by availability and sorted by effective priority, with
    /// least-recently-used breaking ties so a priority band round-robins.
    pub async fn select(
        &self,
        provider: Provider,
        opts: &SelectOptions,
    ) -> Result<Account, SelectError> {
        let now = epoch_ms();

        if let Some(ref bound_id) = opts.bound_account_id {
            let row = self.store.get_account(bound_id).await.map_err(SelectError::Store)?;
            let Some(account) = Account::from_row(&row) else {
                return Err(SelectError::BoundUnavailable {
                    account_id: bound_id.clone(),
                    reason: "account no longer exists".to_owned(),
                });
            };
            return match account.unavailable_reason(now, provider, opts.is_opus) {
                None => Ok(account),
                Some(reason) => {
                    Err(SelectError::BoundUnavailable { account_id: bound_id.clone(), reason })
                }
            };
        }

        let ids = self.store.list_account_ids().await.map_err(SelectError::Store)?;
        let mut candidates = Vec::new();
        for id in ids {
            if opts.exclude.contains(&id) {
                continue;
            }
            let row = self.store.get_account(&id).await.map_err(SelectError::Store)?;
            let Some(account) = Account::from_row(&row) else {
                continue;
            };
            if account.is_available(now, provider, opts.is_opus) {
                candidates.push(account);
            }
        }
        if candidates.is_empty() {
            return Err(SelectError::NoAvailableAccounts);
        }

        candidates.sort_by(|a, b| {
            b.effective_priority()
                .cmp(&a.effective_priority())
                .then_with(|| {
                    // Never-used sorts before any timestamp.
                    a.last_used_at.unwrap_or(0).cmp(&b.last_used_at.unwrap_or(0))
                })
        });

        // Non-empty by the check above.
        candidates
            .into_iter()
            .next()
            .ok_or(SelectError::NoAvailableAccounts)
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
