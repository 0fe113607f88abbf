// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn scanner_reads_message_start_usage_and_model() {
    let mut scanner = SseScanner::new();
    scanner.feed_line("event: message_start");
    scanner.feed_line(
        r#"data: {"type":"message_start","message":{"model":"claude-sonnet-4-20250514","usage":{"input_tokens":10,"cache_read_input_tokens":3,"cache_creation_input_tokens":2,"output_tokens":0}}}"#,
    );

    assert_eq!(scanner.model, "claude-sonnet-4-20250514");
    assert_eq!(scanner.usage.input_tokens, 10);
    assert_eq!(scanner.usage.cache_read_tokens, 3);
    assert_eq!(scanner.usage.cache_create_tokens, 2);
    assert!(!scanner.completed);
}

#[test]
fn scanner_accumulates_output_across_deltas() {
    let mut scanner = SseScanner::new();
    scanner.feed_line(r#"data: {"type":"message_delta","usage":{"output_tokens":5}}"#);
    scanner.feed_line(r#"data: {"type":"message_delta","usage":{"output_tokens":20}}"#);
    assert_eq!(scanner.usage.output_tokens, 20);
}

#[test]
fn scanner_marks_completion_on_message_stop() {
    let mut scanner = SseScanner::new();
    scanner.feed_line(r#"data: {"type":"message_stop"}"#);
    assert!(scanner.completed);
}

#[test]
fn scanner_reads_codex_completed_usage() {
    let mut scanner = SseScanner::new();
    scanner.feed_line(
        r#"data: {"type":"response.completed","response":{"usage":{"input_tokens":7,"output_tokens":11}}}"#,
    );
    assert!(scanner.completed);
    assert_eq!(scanner.usage.input_tokens, 7);
    assert_eq!(scanner.usage.output_tokens, 11);
}

#[test]
fn scanner_ignores_non_data_lines_and_garbage() {
    let mut scanner = SseScanner::new();
    scanner.feed_line("event: ping");
    scanner.feed_line(": comment");
    scanner.feed_line("data: not-json");
    scanner.feed_line("data: [DONE]");
    assert!(scanner.usage.is_empty());
    assert!(!scanner.completed);
}

#[test]
fn line_buffer_splits_chunks_into_lines() -> anyhow::Result<()> {
    let mut buf = LineBuffer::new();
    let lines = buf.push(b"data: a\ndata: b\nda")?;
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], b"data: a\n");
    assert_eq!(lines[1], b"data: b\n");

    let lines = buf.push(b"ta: c\n")?;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0], b"data: c\n");
    assert!(buf.remainder().is_none());
    Ok(())
}

#[test]
fn line_buffer_returns_trailing_partial_line() -> anyhow::Result<()> {
    let mut buf = LineBuffer::new();
    buf.push(b"data: tail-without-newline")?;
    assert_eq!(buf.remainder().as_deref(), Some(b"data: tail-without-newline".as_slice()));
    Ok(())
}

#[test]
fn line_buffer_rejects_oversized_lines() {
    let mut buf = LineBuffer::new();
    let chunk = vec![b'x'; MAX_LINE_BYTES + 2];
    assert!(buf.push(&chunk).is_err());
}
