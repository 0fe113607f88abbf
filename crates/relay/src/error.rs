// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-facing error taxonomy and upstream error sanitization.

use std::fmt;
use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::Json;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Error kinds emitted to clients.
///
/// The wire shape is the Anthropic envelope:
/// `{"type":"error","error":{"type":"<kind>","message":"..."}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayError {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RequestTooLarge,
    RateLimit,
    Api,
    Overloaded,
    Billing,
    SessionBinding,
}

impl RelayError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Authentication => 401,
            Self::Permission => 403,
            Self::NotFound => 404,
            Self::RequestTooLarge => 413,
            Self::RateLimit => 429,
            Self::Api => 500,
            Self::Overloaded => 503,
            Self::Billing => 402,
            Self::SessionBinding => 400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request_error",
            Self::Authentication => "authentication_error",
            Self::Permission => "permission_error",
            Self::NotFound => "not_found_error",
            Self::RequestTooLarge => "request_too_large",
            Self::RateLimit => "rate_limit_error",
            Self::Api => "api_error",
            Self::Overloaded => "overloaded_error",
            Self::Billing => "billing_error",
            Self::SessionBinding => "session_binding_error",
        }
    }

    pub fn to_body(&self, message: impl Into<String>) -> ErrorEnvelope {
        ErrorEnvelope {
            kind: "error".to_owned(),
            error: ErrorBody { kind: self.as_str().to_owned(), message: message.into() },
        }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorEnvelope>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_body(message)))
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub error: ErrorBody,
}

/// Inner error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// A sanitized upstream error, ready to forward to the client.
#[derive(Debug, Clone)]
pub struct SanitizedError {
    pub status: u16,
    pub body: ErrorEnvelope,
}

impl SanitizedError {
    /// Render as an SSE error event for streams that already started.
    pub fn to_sse_event(&self) -> String {
        let data = serde_json::to_string(&self.body).unwrap_or_else(|_| "{}".to_owned());
        format!("event: error\ndata: {data}\n\n")
    }
}

struct BodyRule {
    pattern: Regex,
    kind: RelayError,
    status: u16,
    message: &'static str,
}

fn body_rules() -> &'static Vec<BodyRule> {
    static RULES: OnceLock<Vec<BodyRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let table: &[(&str, RelayError, u16, &'static str)] = &[
            ("too many (requests|tokens)", RelayError::RateLimit, 429, "Rate limit exceeded, please try again later"),
            ("context window|prompt is too long|maximum context", RelayError::InvalidRequest, 400, "Request exceeds the maximum context window"),
            ("content policy|content filtering|harmful", RelayError::Permission, 403, "Request blocked by content policy"),
            ("credit balance|billing|payment required", RelayError::Billing, 402, "Billing issue on the upstream account"),
            ("overloaded", RelayError::Overloaded, 529, "Upstream is overloaded, please retry"),
        ];
        table
            .iter()
            .filter_map(|(pat, kind, status, message)| {
                Regex::new(&format!("(?i){pat}")).ok().map(|pattern| BodyRule {
                    pattern,
                    kind: *kind,
                    status: *status,
                    message,
                })
            })
            .collect()
    })
}

// The pattern is a compile-time constant.
#[allow(clippy::unwrap_used)]
fn route_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[relay/[a-z_-]+\]\s*").unwrap())
}

/// Strip internal route tags like `[relay/claude]` from a message.
pub fn strip_route_tags(message: &str) -> String {
    route_tag_re().replace_all(message, "").into_owned()
}

/// Map an upstream error response to the client taxonomy.
///
/// Precedence: exact status table, then body regex rules, then a preserved
/// `{error.type,error.message}` shape, then the generic 500.
pub fn sanitize_upstream(status: u16, body: &str) -> SanitizedError {
    // (a) statuses with a fixed translation
    let fixed = match status {
        401 => Some((RelayError::Authentication, 401, "Upstream authentication failed")),
        402 => Some((RelayError::Billing, 402, "Billing issue on the upstream account")),
        404 => Some((RelayError::NotFound, 404, "Upstream endpoint not found")),
        413 => Some((RelayError::RequestTooLarge, 413, "Request body too large")),
        429 => Some((RelayError::RateLimit, 429, "Rate limit exceeded, please try again later")),
        529 => Some((RelayError::Overloaded, 529, "Upstream is overloaded, please retry")),
        _ => None,
    };
    if let Some((kind, status, message)) = fixed {
        return SanitizedError { status, body: kind.to_body(message) };
    }

    // (b) body pattern rules
    for rule in body_rules() {
        if rule.pattern.is_match(body) {
            return SanitizedError { status: rule.status, body: rule.kind.to_body(rule.message) };
        }
    }

    // (c) pass through a well-formed upstream envelope, minus route tags
    if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(body) {
        if !parsed.error.kind.is_empty() {
            let message = strip_route_tags(&parsed.error.message);
            return SanitizedError {
                status,
                body: ErrorEnvelope {
                    kind: "error".to_owned(),
                    error: ErrorBody { kind: parsed.error.kind, message },
                },
            };
        }
    }

    // (d) generic fallback
    let kind = if status == 403 { RelayError::Permission } else { RelayError::Api };
    let status = if (500..600).contains(&status) { 502 } else { status.max(400) };
    SanitizedError { status, body: kind.to_body("Upstream request failed") }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
