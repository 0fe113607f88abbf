// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;

#[test]
fn literal_warmup_string_matches() {
    let body = json!({"model": "claude-3-5-haiku-20241022", "messages": [
        {"role": "user", "content": "Warmup"}
    ]});
    assert!(is_warmup(&body));
}

#[test]
fn literal_warmup_single_text_block_matches() {
    let body = json!({"messages": [
        {"role": "user", "content": [{"type": "text", "text": "Warmup"}]}
    ]});
    assert!(is_warmup(&body));
}

#[test]
fn title_generation_system_matches() {
    let body = json!({
        "system": [{"type": "text", "text": "Please write a 5-10 word title for this conversation"}],
        "messages": [{"role": "user", "content": "real content"}]
    });
    assert!(is_warmup(&body));
}

#[test]
fn topic_detection_system_matches() {
    let body = json!({
        "system": "Analyze if this message indicates a new conversation topic.",
        "messages": [{"role": "user", "content": "x"}]
    });
    assert!(is_warmup(&body));
}

#[test]
fn ordinary_requests_do_not_match() {
    let body = json!({
        "system": "You are a coding assistant.",
        "messages": [{"role": "user", "content": "write a program"}]
    });
    assert!(!is_warmup(&body));

    let multi = json!({"messages": [
        {"role": "user", "content": "Warmup"},
        {"role": "assistant", "content": "OK"}
    ]});
    assert!(!is_warmup(&multi));
}

#[test]
fn canned_sequence_has_six_events_ending_in_message_stop() {
    let events = canned_events("claude-3-5-haiku-20241022");
    assert_eq!(events.len(), 6);
    assert!(events[0].contains("message_start"));
    assert!(events[0].contains("\"input_tokens\":5"));
    assert!(events[2].contains("\"text\":\"OK\""));
    assert!(events[4].contains("\"output_tokens\":1"));
    assert!(events[5].contains("message_stop"));
    for event in &events {
        assert!(event.ends_with("\n\n"), "SSE event must end with a blank line");
    }
}
