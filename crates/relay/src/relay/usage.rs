// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token usage accounting and request cost.

use serde_json::Value;

/// Token counters observed on one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_create_tokens: u64,
}

impl Usage {
    /// Merge counters from a `usage` JSON object. Input-side counters come
    /// once (on `message_start` or the full body); output tokens grow across
    /// `message_delta` events, so the largest value wins.
    pub fn absorb(&mut self, usage: &Value) {
        let get = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
        self.input_tokens = self.input_tokens.max(get("input_tokens"));
        self.output_tokens = self.output_tokens.max(get("output_tokens"));
        self.cache_read_tokens = self.cache_read_tokens.max(get("cache_read_input_tokens"));
        self.cache_create_tokens =
            self.cache_create_tokens.max(get("cache_creation_input_tokens"));
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Per-million-token prices in USD.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_create: f64,
}

/// Price schedule for a model, matched by lower-cased substring.
pub fn pricing_for(model: &str) -> Pricing {
    let model = model.to_lowercase();
    let claude = |input: f64, output: f64| Pricing {
        input,
        output,
        cache_read: input * 0.1,
        cache_create: input * 1.25,
    };
    let codex = |input: f64, output: f64| Pricing {
        input,
        output,
        cache_read: input * 0.25,
        cache_create: 0.0,
    };

    if model.contains("opus") {
        claude(15.0, 75.0)
    } else if model.contains("haiku") {
        claude(0.8, 4.0)
    } else if model.contains("o3") {
        codex(2.0, 8.0)
    } else if model.contains("o4-mini") {
        codex(1.1, 4.4)
    } else if model.contains("codex-mini") {
        codex(1.5, 6.0)
    } else if model.contains("4.1-nano") {
        codex(0.1, 0.4)
    } else if model.contains("4.1-mini") {
        codex(0.4, 1.6)
    } else if model.contains("4.1") {
        codex(2.0, 8.0)
    } else {
        // Sonnet is the Claude default tier.
        claude(3.0, 15.0)
    }
}

/// Dollar cost of a request.
pub fn cost_usd(model: &str, usage: &Usage) -> f64 {
    let p = pricing_for(model);
    (usage.input_tokens as f64 * p.input
        + usage.output_tokens as f64 * p.output
        + usage.cache_read_tokens as f64 * p.cache_read
        + usage.cache_create_tokens as f64 * p.cache_create)
        / 1_000_000.0
}

/// Extract usage from a complete (non-streaming) response body.
pub fn usage_from_json(body: &Value) -> Usage {
    let mut usage = Usage::default();
    if let Some(u) = body.get("usage") {
        usage.absorb(u);
    }
    usage
}

#[cfg(test)]
#[path = "usage_tests.rs"]
mod tests;
