use regex::Regex;
use sha2::{Digest, Sha256};

const SYSTEM_PROMPT_PREFIX_CHARS: usize = 512;
const FIRST_MESSAGE_PREFIX_CHARS: usize = 256;

/// Derives the sticky-session hash from a parsed request body.
///
/// First non-empty source wins: `metadata.user_id`, then the trimmed
/// system prompt prefix, then the trimmed first user message prefix.
/// The source is prefixed with its kind before hashing so the three
/// namespaces cannot collide. Returns `None` when no source is present,
/// in which case no binding is made.
pub fn generate_session_hash(body: &serde_json::Value) -> Option<String> {
    if let Some(user_id) = body
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
    {
        let trimmed = user_id.trim();
        if !trimmed.is_empty() {
            // Agent clients encode a per-conversation uuid into user_id;
            // key on it when present so one conversation maps to one
            // account across reconnects.
            let key = Regex::new(r"session_([a-f0-9-]{36})")
                .ok()
                .and_then(|re| re.captures(trimmed).map(|c| c[1].to_string()))
                .unwrap_or_else(|| trimmed.to_string());
            return Some(hash_source("user", &key));
        }
    }

    if let Some(system) = body.get("system") {
        let text = extract_system_text(system);
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            return Some(hash_source(
                "system",
                &char_prefix(trimmed, SYSTEM_PROMPT_PREFIX_CHARS),
            ));
        }
    }

    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        if let Some(first_user) = messages
            .iter()
            .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
        {
            let text = extract_message_text(first_user);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(hash_source(
                    "message",
                    &char_prefix(trimmed, FIRST_MESSAGE_PREFIX_CHARS),
                ));
            }
        }
    }

    None
}

fn char_prefix(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn extract_system_text(system: &serde_json::Value) -> String {
    if let Some(text) = system.as_str() {
        return text.to_string();
    }

    if let Some(parts) = system.as_array() {
        return parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("");
    }

    String::new()
}

fn extract_message_text(msg: &serde_json::Value) -> String {
    if let Some(content) = msg.get("content") {
        if let Some(text) = content.as_str() {
            return text.to_string();
        }

        if let Some(parts) = content.as_array() {
            return parts
                .iter()
                .filter_map(|p| {
                    if p.get("type").and_then(|t| t.as_str()) == Some("text") {
                        p.get("text").and_then(|t| t.as_str())
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("");
        }
    }

    // OpenAI chat bodies put text directly under `content`; anything
    // else contributes nothing to the hash.
    String::new()
}

fn hash_source(kind: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b":");
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
