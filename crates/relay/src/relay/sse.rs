// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Incremental SSE scanning for streamed upstream responses.

use serde_json::Value;

use crate::relay::usage::Usage;

/// Longest accepted SSE line. Anything larger aborts the stream rather than
/// buffering unbounded upstream output.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Scans SSE `data:` lines for usage counters and terminal events.
#[derive(Debug, Default)]
pub struct SseScanner {
    pub usage: Usage,
    pub model: String,
    /// Set once `message_stop` (Claude) or `response.completed` (Codex) is seen.
    pub completed: bool,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline).
    pub fn feed_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return;
        };
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };
        let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "message_start" => {
                if let Some(message) = event.get("message") {
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        self.model = model.to_owned();
                    }
                    if let Some(usage) = message.get("usage") {
                        self.usage.absorb(usage);
                    }
                }
            }
            "message_delta" => {
                if let Some(usage) = event.get("usage") {
                    self.usage.absorb(usage);
                }
            }
            "message_stop" | "response.completed" => {
                // Codex carries final usage on the completed response object.
                if let Some(usage) = event.get("response").and_then(|r| r.get("usage")) {
                    self.usage.absorb(usage);
                }
                self.completed = true;
            }
            _ => {}
        }
    }
}

/// Splits a byte stream into lines, feeding each to the scanner, and
/// enforcing the per-line cap. Returns complete lines ready to forward.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk; returns the complete lines it closed, newline included.
    ///
    /// Errors when a single line exceeds [`MAX_LINE_BYTES`].
    pub fn push(&mut self, chunk: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        for byte in chunk {
            self.buf.push(*byte);
            if *byte == b'\n' {
                lines.push(std::mem::take(&mut self.buf));
            } else if self.buf.len() > MAX_LINE_BYTES {
                anyhow::bail!("SSE line exceeds {MAX_LINE_BYTES} bytes");
            }
        }
        Ok(lines)
    }

    /// Whatever is left after the stream ends.
    pub fn remainder(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;
