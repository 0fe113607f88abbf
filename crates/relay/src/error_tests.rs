// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn taxonomy_maps_kinds_to_statuses() {
    assert_eq!(RelayError::InvalidRequest.http_status(), 400);
    assert_eq!(RelayError::Authentication.http_status(), 401);
    assert_eq!(RelayError::Billing.http_status(), 402);
    assert_eq!(RelayError::Permission.http_status(), 403);
    assert_eq!(RelayError::NotFound.http_status(), 404);
    assert_eq!(RelayError::RequestTooLarge.http_status(), 413);
    assert_eq!(RelayError::RateLimit.http_status(), 429);
    assert_eq!(RelayError::Api.http_status(), 500);
    assert_eq!(RelayError::Overloaded.http_status(), 503);
    assert_eq!(RelayError::SessionBinding.http_status(), 400);
}

#[test]
fn envelope_has_the_anthropic_shape() -> anyhow::Result<()> {
    let body = RelayError::Overloaded.to_body("no available accounts");
    let json = serde_json::to_value(&body)?;
    assert_eq!(json["type"], "error");
    assert_eq!(json["error"]["type"], "overloaded_error");
    assert_eq!(json["error"]["message"], "no available accounts");
    Ok(())
}

#[test]
fn fixed_statuses_win_over_body_content() {
    let out = sanitize_upstream(401, r#"{"error":{"type":"weird","message":"whatever"}}"#);
    assert_eq!(out.status, 401);
    assert_eq!(out.body.error.kind, "authentication_error");
}

#[test]
fn body_rules_match_case_insensitively() {
    let out = sanitize_upstream(400, "Your prompt exceeds the CONTEXT WINDOW limit");
    assert_eq!(out.status, 400);
    assert_eq!(out.body.error.kind, "invalid_request_error");

    let out = sanitize_upstream(500, "Too Many Requests from this org");
    assert_eq!(out.status, 429);
    assert_eq!(out.body.error.kind, "rate_limit_error");
}

#[test]
fn well_formed_upstream_envelope_is_preserved() {
    let out = sanitize_upstream(
        400,
        r#"{"type":"error","error":{"type":"invalid_request_error","message":"[relay/claude] bad field"}}"#,
    );
    assert_eq!(out.status, 400);
    assert_eq!(out.body.error.kind, "invalid_request_error");
    assert_eq!(out.body.error.message, "bad field");
}

#[test]
fn unknown_5xx_collapses_to_generic_502() {
    let out = sanitize_upstream(500, "<html>backend exploded</html>");
    assert_eq!(out.status, 502);
    assert_eq!(out.body.error.kind, "api_error");
}

#[test]
fn unknown_403_keeps_permission_kind() {
    let out = sanitize_upstream(403, "nope");
    assert_eq!(out.status, 403);
    assert_eq!(out.body.error.kind, "permission_error");
}

#[test]
fn route_tags_are_stripped() {
    assert_eq!(strip_route_tags("[relay/claude] upstream says no"), "upstream says no");
    assert_eq!(strip_route_tags("plain message"), "plain message");
}

#[test]
fn sse_error_event_shape() {
    let sanitized = sanitize_upstream(529, "");
    let event = sanitized.to_sse_event();
    assert!(event.starts_with("event: error\ndata: "));
    assert!(event.ends_with("\n\n"));
    assert!(event.contains("overloaded_error"));
}
