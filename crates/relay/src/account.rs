// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Account and user models over the store's stringly-typed rows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A durable store row: named string fields.
pub type RowMap = HashMap<String, String>;

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Upstream provider an account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }
}

/// Lifecycle status of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Created,
    Active,
    Error,
    Disabled,
    Blocked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Error => "error",
            Self::Disabled => "disabled",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "error" => Self::Error,
            "disabled" => Self::Disabled,
            "blocked" => Self::Blocked,
            _ => Self::Created,
        }
    }
}

/// How the scheduler weighs this account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityMode {
    Auto,
    Manual,
}

/// Outbound proxy configuration for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// "socks5", "http", or "https".
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Proxy URL consumed by the HTTP client. SOCKS5 uses remote DNS so the
    /// exit sees the lookup, matching direct traffic.
    pub fn url(&self) -> String {
        let scheme = match self.kind.as_str() {
            "socks5" => "socks5h",
            "https" => "https",
            _ => "http",
        };
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{scheme}://{user}:{pass}@{}:{}", self.host, self.port)
            }
            _ => format!("{scheme}://{}:{}", self.host, self.port),
        }
    }

    /// Key identifying a distinct connection configuration in the client pool.
    pub fn pool_key(&self) -> String {
        format!("{}:{}:{}:{}", self.kind, self.host, self.port, self.username.as_deref().unwrap_or(""))
    }
}

/// One upstream OAuth account.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub provider: Provider,
    /// Free-form provider metadata (`orgUUID`, `chatgptAccountId`, `account_uuid`).
    pub ext_info: serde_json::Map<String, serde_json::Value>,
    pub created_at: u64,

    /// Encrypted at rest; decrypt via [`crate::crypto::Cipher`].
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry, epoch millis. Zero means unknown.
    pub expires_at: u64,

    pub status: AccountStatus,
    pub schedulable: bool,
    pub priority: i64,
    pub priority_mode: PriorityMode,
    pub last_used_at: Option<u64>,
    pub last_refresh_at: Option<u64>,

    pub five_hour_status: String,
    pub five_hour_util: Option<f64>,
    /// Window reset, epoch seconds (upstream header unit).
    pub five_hour_reset: Option<u64>,
    pub seven_day_util: Option<f64>,
    pub seven_day_reset: Option<u64>,
    pub codex_primary_util: Option<f64>,
    pub codex_primary_reset: Option<u64>,
    pub codex_secondary_util: Option<f64>,
    pub codex_secondary_reset: Option<u64>,
    /// Opus-specific cooldown, epoch millis.
    pub opus_rate_limit_end_at: Option<u64>,
    pub overloaded_at: Option<u64>,
    pub overloaded_until: Option<u64>,
    pub error_message: String,

    pub proxy: Option<ProxyConfig>,
}

fn get_u64(row: &RowMap, key: &str) -> Option<u64> {
    row.get(key).and_then(|v| v.parse().ok()).filter(|v| *v > 0)
}

fn get_f64(row: &RowMap, key: &str) -> Option<f64> {
    row.get(key).filter(|v| !v.is_empty()).and_then(|v| v.parse().ok())
}

impl Account {
    /// Build an account from a store row. Returns `None` for an empty row
    /// (the store's "not found") or one without an id/provider.
    pub fn from_row(row: &RowMap) -> Option<Self> {
        let id = row.get("id").filter(|v| !v.is_empty())?.clone();
        let provider = Provider::parse(row.get("provider").map(String::as_str).unwrap_or(""))?;
        let ext_info = row
            .get("extInfo")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let proxy = row.get("proxy").and_then(|v| serde_json::from_str(v).ok());

        Some(Self {
            id,
            email: row.get("email").cloned().unwrap_or_default(),
            provider,
            ext_info,
            created_at: get_u64(row, "createdAt").unwrap_or(0),
            access_token: row.get("accessToken").cloned().unwrap_or_default(),
            refresh_token: row.get("refreshToken").cloned().unwrap_or_default(),
            expires_at: get_u64(row, "expiresAt").unwrap_or(0),
            status: AccountStatus::parse(row.get("status").map(String::as_str).unwrap_or("")),
            schedulable: row.get("schedulable").map(String::as_str) == Some("true"),
            priority: row.get("priority").and_then(|v| v.parse().ok()).unwrap_or(50),
            priority_mode: match row.get("priorityMode").map(String::as_str) {
                Some("manual") => PriorityMode::Manual,
                _ => PriorityMode::Auto,
            },
            last_used_at: get_u64(row, "lastUsedAt"),
            last_refresh_at: get_u64(row, "lastRefreshAt"),
            five_hour_status: row.get("fiveHourStatus").cloned().unwrap_or_default(),
            five_hour_util: get_f64(row, "fiveHourUtil"),
            five_hour_reset: get_u64(row, "fiveHourReset"),
            seven_day_util: get_f64(row, "sevenDayUtil"),
            seven_day_reset: get_u64(row, "sevenDayReset"),
            codex_primary_util: get_f64(row, "codexPrimaryUtil"),
            codex_primary_reset: get_u64(row, "codexPrimaryReset"),
            codex_secondary_util: get_f64(row, "codexSecondaryUtil"),
            codex_secondary_reset: get_u64(row, "codexSecondaryReset"),
            opus_rate_limit_end_at: get_u64(row, "opusRateLimitEndAt"),
            overloaded_at: get_u64(row, "overloadedAt"),
            overloaded_until: get_u64(row, "overloadedUntil"),
            error_message: row.get("errorMessage").cloned().unwrap_or_default(),
            proxy,
        })
    }

    /// Serialize to a full store row.
    pub fn to_row(&self) -> RowMap {
        let mut row = RowMap::new();
        row.insert("id".into(), self.id.clone());
        row.insert("email".into(), self.email.clone());
        row.insert("provider".into(), self.provider.as_str().into());
        row.insert(
            "extInfo".into(),
            serde_json::Value::Object(self.ext_info.clone()).to_string(),
        );
        row.insert("createdAt".into(), self.created_at.to_string());
        row.insert("accessToken".into(), self.access_token.clone());
        row.insert("refreshToken".into(), self.refresh_token.clone());
        row.insert("expiresAt".into(), self.expires_at.to_string());
        row.insert("status".into(), self.status.as_str().into());
        row.insert("schedulable".into(), self.schedulable.to_string());
        row.insert("priority".into(), self.priority.to_string());
        row.insert(
            "priorityMode".into(),
            match self.priority_mode {
                PriorityMode::Auto => "auto".into(),
                PriorityMode::Manual => "manual".into(),
            },
        );
        let put_opt_u64 = |row: &mut RowMap, key: &str, v: Option<u64>| {
            row.insert(key.into(), v.map(|v| v.to_string()).unwrap_or_default());
        };
        let put_opt_f64 = |row: &mut RowMap, key: &str, v: Option<f64>| {
            row.insert(key.into(), v.map(|v| v.to_string()).unwrap_or_default());
        };
        put_opt_u64(&mut row, "lastUsedAt", self.last_used_at);
        put_opt_u64(&mut row, "lastRefreshAt", self.last_refresh_at);
        row.insert("fiveHourStatus".into(), self.five_hour_status.clone());
        put_opt_f64(&mut row, "fiveHourUtil", self.five_hour_util);
        put_opt_u64(&mut row, "fiveHourReset", self.five_hour_reset);
        put_opt_f64(&mut row, "sevenDayUtil", self.seven_day_util);
        put_opt_u64(&mut row, "sevenDayReset", self.seven_day_reset);
        put_opt_f64(&mut row, "codexPrimaryUtil", self.codex_primary_util);
        put_opt_u64(&mut row, "codexPrimaryReset", self.codex_primary_reset);
        put_opt_f64(&mut row, "codexSecondaryUtil", self.codex_secondary_util);
        put_opt_u64(&mut row, "codexSecondaryReset", self.codex_secondary_reset);
        put_opt_u64(&mut row, "opusRateLimitEndAt", self.opus_rate_limit_end_at);
        put_opt_u64(&mut row, "overloadedAt", self.overloaded_at);
        put_opt_u64(&mut row, "overloadedUntil", self.overloaded_until);
        row.insert("errorMessage".into(), self.error_message.clone());
        row.insert(
            "proxy".into(),
            self.proxy
                .as_ref()
                .and_then(|p| serde_json::to_string(p).ok())
                .unwrap_or_default(),
        );
        row
    }

    /// Whether this account can serve a request right now.
    pub fn is_available(&self, now_ms: u64, provider: Provider, is_opus: bool) -> bool {
        self.unavailable_reason(now_ms, provider, is_opus).is_none()
    }

    /// Why this account cannot serve a request, or `None` if it can.
    pub fn unavailable_reason(
        &self,
        now_ms: u64,
        provider: Provider,
        is_opus: bool,
    ) -> Option<String> {
        if self.provider != provider {
            return Some(format!("account serves {}", self.provider.as_str()));
        }
        if self.status != AccountStatus::Active {
            return Some(format!("account status is {}", self.status.as_str()));
        }
        if !self.schedulable {
            return Some("account is not schedulable".to_owned());
        }
        if let Some(until) = self.overloaded_until {
            if now_ms < until {
                return Some(format!("account cooling down for {}s", (until - now_ms) / 1000));
            }
        }
        if is_opus {
            if let Some(until) = self.opus_rate_limit_end_at {
                if now_ms < until {
                    return Some(format!(
                        "account opus-limited for {}s",
                        (until - now_ms) / 1000
                    ));
                }
            }
        }
        None
    }

    /// Effective scheduling priority in `[0, 100]`, higher first.
    ///
    /// Auto mode tracks the least-remaining rate-limit window; unknown
    /// utilization counts as a fully fresh window.
    pub fn effective_priority(&self) -> i64 {
        if self.priority_mode == PriorityMode::Manual {
            return self.priority.clamp(0, 100);
        }
        let remaining = |util: Option<f64>| -> i64 {
            match util {
                Some(u) => (100.0 * (1.0 - u.clamp(0.0, 1.0))).round() as i64,
                None => 100,
            }
        };
        match self.provider {
            Provider::Claude => {
                remaining(self.five_hour_util).min(remaining(self.seven_day_util))
            }
            Provider::Codex => {
                remaining(self.codex_primary_util).min(remaining(self.codex_secondary_util))
            }
        }
    }

    /// `extInfo.account_uuid` when present, else the account id. Anchors the
    /// rewritten `metadata.user_id`.
    pub fn identity_uuid(&self) -> &str {
        self.ext_info
            .get("account_uuid")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.id)
    }

    /// `extInfo.chatgptAccountId` for Codex dispatch headers.
    pub fn chatgpt_account_id(&self) -> Option<&str> {
        self.ext_info
            .get("chatgptAccountId")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// Status of a relay API principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Active,
    Disabled,
}

/// A relay-side API principal. The store keeps only the token hash.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
    pub token_hash: String,
    pub token_prefix: String,
    pub status: UserStatus,
    pub created_at: u64,
    pub last_active_at: Option<u64>,
}

impl User {
    pub fn from_row(row: &RowMap) -> Option<Self> {
        let id = row.get("id").filter(|v| !v.is_empty())?.clone();
        Some(Self {
            id,
            name: row.get("name").cloned().unwrap_or_default(),
            token_hash: row.get("tokenHash").cloned().unwrap_or_default(),
            token_prefix: row.get("tokenPrefix").cloned().unwrap_or_default(),
            status: match row.get("status").map(String::as_str) {
                Some("disabled") => UserStatus::Disabled,
                _ => UserStatus::Active,
            },
            created_at: get_u64(row, "createdAt").unwrap_or(0),
            last_active_at: get_u64(row, "lastActiveAt"),
        })
    }

    pub fn to_row(&self) -> RowMap {
        let mut row = RowMap::new();
        row.insert("id".into(), self.id.clone());
        row.insert("name".into(), self.name.clone());
        row.insert("tokenHash".into(), self.token_hash.clone());
        row.insert("tokenPrefix".into(), self.token_prefix.clone());
        row.insert(
            "status".into(),
            match self.status {
                UserStatus::Active => "active".into(),
                UserStatus::Disabled => "disabled".into(),
            },
        );
        row.insert("createdAt".into(), self.created_at.to_string());
        row.insert(
            "lastActiveAt".into(),
            self.last_active_at.map(|v| v.to_string()).unwrap_or_default(),
        );
        row
    }
}

#[cfg(test)]
#[path = "account_tests.rs"]
mod tests;
