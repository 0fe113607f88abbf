// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local answers for client warmup pings.
//!
//! The CLI fires non-productive requests to pre-warm its UI (a literal
//! "Warmup" message, title generation, topic detection). Answering locally
//! spends no account quota and keeps warmups out of the usage log.

use std::time::Duration;

use serde_json::Value;

/// System prompts that identify background utility requests.
const WARMUP_SYSTEM_MARKERS: &[&str] = &[
    "Please write a 5-10 word title",
    "nalyze if this message indicates a new conversation topic",
];

/// Delay between canned SSE events; approximates a real first-token cadence.
pub const EVENT_DELAY: Duration = Duration::from_millis(20);

/// Whether this request body is a warmup the relay should answer itself.
pub fn is_warmup(body: &Value) -> bool {
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        if messages.len() == 1 && message_is_literal_warmup(&messages[0]) {
            return true;
        }
    }
    let system_text = collect_system_text(body);
    WARMUP_SYSTEM_MARKERS.iter().any(|marker| system_text.contains(marker))
}

fn message_is_literal_warmup(message: &Value) -> bool {
    match message.get("content") {
        Some(Value::String(s)) => s == "Warmup",
        Some(Value::Array(blocks)) => {
            blocks.len() == 1
                && blocks[0].get("text").and_then(Value::as_str) == Some("Warmup")
        }
        _ => false,
    }
}

fn collect_system_text(body: &Value) -> String {
    match body.get("system") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(|e| e.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// The canned six-event SSE sequence answering a warmup.
pub fn canned_events(model: &str) -> Vec<String> {
    let events: Vec<(&str, Value)> = vec![
        (
            "message_start",
            serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": "msg_warmup",
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                    "usage": {"input_tokens": 5, "output_tokens": 0}
                }
            }),
        ),
        (
            "content_block_start",
            serde_json::json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""}
            }),
        ),
        (
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": "OK"}
            }),
        ),
        ("content_block_stop", serde_json::json!({"type": "content_block_stop", "index": 0})),
        (
            "message_delta",
            serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": 1}
            }),
        ),
        ("message_stop", serde_json::json!({"type": "message_stop"})),
    ];

    events
        .into_iter()
        .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
        .collect()
}

#[cfg(test)]
#[path = "warmup_tests.rs"]
mod tests;
