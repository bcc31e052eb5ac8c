use bytes::Bytes;
use ccproxy_core::Result;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Inbound headers forwarded verbatim to the upstream. The route layer
/// fills this from its allow-list.
#[derive(Debug, Clone, Default)]
pub struct ClientHeaders {
    headers: HashMap<String, String>,
}

impl ClientHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.headers.insert(key, value);
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.headers.iter()
    }
}

/// Token counts observed in an upstream response or SSE stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageTotals {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_creation_input_tokens: Option<u32>,
    pub cache_read_input_tokens: Option<u32>,
}

impl UsageTotals {
    /// Streaming deltas repeat totals; keep the high-water mark.
    pub fn merge_max(&mut self, other: &UsageTotals) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        if other.cache_creation_input_tokens.is_some() {
            self.cache_creation_input_tokens = other.cache_creation_input_tokens;
        }
        if other.cache_read_input_tokens.is_some() {
            self.cache_read_input_tokens = other.cache_read_input_tokens;
        }
    }

    pub fn observed(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0
    }
}

/// Reads usage from a response body: top-level `usage`, or the
/// `message.usage` shape of a message_start event.
pub fn usage_from_value(value: &serde_json::Value) -> Option<UsageTotals> {
    let usage = value
        .get("usage")
        .or_else(|| value.get("message").and_then(|m| m.get("usage")))?;

    let read = |key: &str| usage.get(key).and_then(|v| v.as_u64()).map(|v| v as u32);

    let totals = UsageTotals {
        input_tokens: read("input_tokens").unwrap_or(0),
        output_tokens: read("output_tokens").unwrap_or(0),
        cache_creation_input_tokens: read("cache_creation_input_tokens"),
        cache_read_input_tokens: read("cache_read_input_tokens"),
    };

    totals.observed().then_some(totals)
}

/// Scans the `data:` lines of an SSE chunk for usage payloads.
pub fn extract_usage_from_chunk(chunk: &Bytes) -> Option<UsageTotals> {
    let text = std::str::from_utf8(chunk).ok()?;

    for line in text.lines() {
        let Some(json_str) = line.strip_prefix("data: ") else {
            continue;
        };
        if json_str == "[DONE]" {
            continue;
        }

        let Ok(value) = serde_json::from_str::<serde_json::Value>(json_str) else {
            continue;
        };

        if let Some(usage) = usage_from_value(&value) {
            return Some(usage);
        }
    }

    None
}
