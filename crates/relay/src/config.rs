// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Configuration for the relay server.
#[derive(Debug, Clone, clap::Parser)]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "PORT")]
    pub port: u16,

    /// Path to the durable store snapshot file.
    #[arg(long, default_value = "relay.db.json", env = "DB_PATH")]
    pub db_path: std::path::PathBuf,

    /// Secret used to derive the token-at-rest encryption key.
    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: String,

    /// Admin bearer token.
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Claude upstream base URL.
    #[arg(long, default_value = "https://api.anthropic.com", env = "CLAUDE_API_URL")]
    pub claude_api_url: String,

    /// `anthropic-version` header sent upstream.
    #[arg(long, default_value = "2023-06-01", env = "CLAUDE_API_VERSION")]
    pub claude_api_version: String,

    /// Default `anthropic-beta` value merged with the client's.
    #[arg(long, default_value = "claude-code-20250219,oauth-2025-04-20", env = "CLAUDE_BETA_HEADER")]
    pub claude_beta_header: String,

    /// Codex upstream base URL.
    #[arg(long, default_value = "https://chatgpt.com/backend-api", env = "CODEX_API_URL")]
    pub codex_api_url: String,

    /// Session binding lifetime in seconds.
    #[arg(long, default_value_t = 86_400, env = "SESSION_BINDING_TTL")]
    pub session_binding_ttl_secs: u64,

    /// Refresh access tokens this many seconds before expiry.
    #[arg(long, default_value_t = 60, env = "TOKEN_REFRESH_ADVANCE")]
    pub token_refresh_advance_secs: u64,

    /// Account cooldown after an upstream 401, seconds.
    #[arg(long, default_value_t = 1_800, env = "ERROR_PAUSE_401")]
    pub error_pause_401_secs: u64,

    /// Account cooldown after a generic upstream 403, seconds.
    #[arg(long, default_value_t = 600, env = "ERROR_PAUSE_403")]
    pub error_pause_403_secs: u64,

    /// Account cooldown after an upstream 429 without a reset header, seconds.
    #[arg(long, default_value_t = 300, env = "ERROR_PAUSE_429")]
    pub error_pause_429_secs: u64,

    /// Account cooldown after an upstream 529, seconds.
    #[arg(long, default_value_t = 300, env = "ERROR_PAUSE_529")]
    pub error_pause_529_secs: u64,

    /// Total upstream request timeout in seconds.
    #[arg(long, default_value_t = 300, env = "REQUEST_TIMEOUT")]
    pub request_timeout_secs: u64,

    /// Maximum accepted request body size in megabytes.
    #[arg(long, default_value_t = 10, env = "REQUEST_MAX_SIZE_MB")]
    pub request_max_size_mb: usize,

    /// Extra accounts tried after the first pick fails with a retriable status.
    #[arg(long, default_value_t = 2, env = "MAX_RETRY_ACCOUNTS")]
    pub max_retry_accounts: usize,

    /// Maximum `cache_control` blocks kept in a request body.
    #[arg(long, default_value_t = 4, env = "MAX_CACHE_CONTROLS")]
    pub max_cache_controls: usize,

    /// Log level filter (overridden by RUST_LOG when set).
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,
}

impl RelayConfig {
    pub fn session_binding_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session_binding_ttl_secs)
    }

    pub fn token_refresh_advance(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.token_refresh_advance_secs)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn error_pause(&self, status: u16) -> std::time::Duration {
        let secs = match status {
            401 => self.error_pause_401_secs,
            403 => self.error_pause_403_secs,
            429 => self.error_pause_429_secs,
            _ => self.error_pause_529_secs,
        };
        std::time::Duration::from_secs(secs)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.request_max_size_mb * 1024 * 1024
    }
}
