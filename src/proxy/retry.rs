//! Retry, fallback, and context-trim policy shared by the translation
//! handler.
//!
//! A request gets at most one network retry per attempted dialect, with
//! exponential backoff, plus a handful of one-shot targeted remediations
//! (401 replay, context-overflow trim, stale-chain replay). Once response
//! headers have been flushed to the client no further retry is attempted;
//! a terminal failure degrades to a graceful SSE close instead.

use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const BASE_BACKOFF_MS: u64 = 1000;
const RESET_BASE_BACKOFF_MS: u64 = 3000;
const MAX_BACKOFF_MS: u64 = 15_000;

const RETRYABLE_NETWORK_SUBSTRINGS: &[&str] = &[
    "connection reset",
    "econnreset",
    "timed out",
    "etimedout",
    "broken pipe",
    "epipe",
    "connection refused",
    "econnrefused",
    "dns error",
    "enotfound",
    "failed to lookup",
    "ehostunreach",
    "host unreachable",
    "enetunreach",
    "network unreachable",
    "socket hang up",
    "socket disconnected",
];

const CONTEXT_OVERFLOW_SUBSTRINGS: &[&str] = &[
    "exceeds the context window",
    "context_length_exceeded",
    "prompt is too long",
    "maximum context length",
    "input is too long",
];

const RETRYABLE_STATUSES: &[u16] = &[408, 409, 425, 429, 500, 502, 503, 504];

/// Whether a lower-level transport error (as rendered by its `Display` impl)
/// matches one of the retryable network error classes.
pub fn is_retryable_network_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_NETWORK_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Case-insensitive match against the known context-overflow phrasings.
pub fn is_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    CONTEXT_OVERFLOW_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Backoff delay for the (single) retry attempt. `reset` widens the base
/// delay for `ECONNRESET`-class failures, per policy.
pub fn backoff_delay(reset: bool) -> Duration {
    let base = if reset {
        RESET_BASE_BACKOFF_MS
    } else {
        BASE_BACKOFF_MS
    };
    let capped = base.min(MAX_BACKOFF_MS);
    let jitter = rand_jitter_ms(capped);
    Duration::from_millis(capped + jitter)
}

/// Fixed delay for the one-shot 401 replay.
pub fn unauthorized_retry_delay() -> Duration {
    Duration::from_millis(500)
}

/// Cheap, allocation-free jitter derived from the system clock's low bits.
/// Not cryptographic, just enough spread to avoid synchronized retries.
fn rand_jitter_ms(base: u64) -> u64 {
    let max_jitter = (base / 10).max(1);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % max_jitter
}

// ============================================================================
// Trim algorithm
// ============================================================================

const PROTECTED_TAIL_MIN: usize = 10;
const PROTECTED_TAIL_FRACTION: f64 = 0.3;
const TOOL_RESULT_MAX_CHARS: usize = 200;
const ASSISTANT_TEXT_MAX_CHARS: usize = 500;
const ASSISTANT_TEXT_TRUNCATE_CHARS: usize = 200;
const OLDER_PREFIX_MAX: usize = 10;
const OLDER_PREFIX_KEEP: usize = 6;

/// Apply the context-trim algorithm to an OpenAI-shape `messages` array.
/// System messages are always kept; everything else is subject to
/// progressive trimming, with the most recent messages protected.
pub fn trim_messages(messages: &[Value]) -> Vec<Value> {
    let (system, non_system): (Vec<Value>, Vec<Value>) = messages
        .iter()
        .cloned()
        .partition(|m| m.get("role").and_then(|r| r.as_str()) == Some("system"));

    if non_system.is_empty() {
        return system;
    }

    let protected_len = ((non_system.len() as f64 * PROTECTED_TAIL_FRACTION).ceil() as usize)
        .max(PROTECTED_TAIL_MIN)
        .min(non_system.len());
    let split_at = non_system.len() - protected_len;
    let (older, tail) = non_system.split_at(split_at);

    let mut older: Vec<Value> = older.iter().map(trim_message_content).collect();
    older.retain(|m| m.get("role").and_then(|r| r.as_str()) != Some("tool"));
    for msg in older.iter_mut() {
        strip_tool_calls(msg);
    }

    if older.len() > OLDER_PREFIX_MAX {
        let drop = older.len() - OLDER_PREFIX_KEEP;
        older.drain(0..drop);
    }

    let mut result = system;
    result.extend(older);
    result.extend(tail.iter().cloned());
    drop_orphaned_tool_messages(result)
}

fn trim_message_content(msg: &Value) -> Value {
    let mut msg = msg.clone();
    let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");

    if role == "tool" {
        if let Some(content) = msg.get("content").and_then(|c| c.as_str()) {
            if content.chars().count() > TOOL_RESULT_MAX_CHARS {
                msg["content"] = Value::String("[trimmed tool output]".to_string());
            }
        }
    } else if role == "assistant" {
        if let Some(content) = msg.get("content").and_then(|c| c.as_str()) {
            if content.chars().count() > ASSISTANT_TEXT_MAX_CHARS {
                let truncated: String = content.chars().take(ASSISTANT_TEXT_TRUNCATE_CHARS).collect();
                msg["content"] = Value::String(format!("{}\n...[trimmed]", truncated));
            }
        }
    }

    msg
}

fn strip_tool_calls(msg: &mut Value) {
    let Some(obj) = msg.as_object_mut() else {
        return;
    };
    if obj.remove("tool_calls").is_some() {
        let content_is_empty = matches!(obj.get("content"), None | Some(Value::Null));
        if content_is_empty {
            obj.insert(
                "content".to_string(),
                Value::String("[tool calls removed]".to_string()),
            );
        }
    }
}

fn drop_orphaned_tool_messages(messages: Vec<Value>) -> Vec<Value> {
    let mut known_call_ids = std::collections::HashSet::new();
    for msg in &messages {
        if let Some(tool_calls) = msg.get("tool_calls").and_then(|t| t.as_array()) {
            for call in tool_calls {
                if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                    known_call_ids.insert(id.to_string());
                }
            }
        }
    }

    messages
        .into_iter()
        .filter(|msg| {
            if msg.get("role").and_then(|r| r.as_str()) != Some("tool") {
                return true;
            }
            match msg.get("tool_call_id").and_then(|v| v.as_str()) {
                Some(id) => known_call_ids.contains(id),
                None => false,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn network_error_classification() {
        assert!(is_retryable_network_error("Connection reset by peer"));
        assert!(is_retryable_network_error("operation timed out"));
        assert!(!is_retryable_network_error("invalid header value"));
    }

    #[test]
    fn status_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn context_overflow_matches_case_insensitively() {
        assert!(is_context_overflow("Error: CONTEXT_LENGTH_EXCEEDED"));
        assert!(is_context_overflow("the prompt is too long for this model"));
        assert!(!is_context_overflow("rate limited, try again"));
    }

    #[test]
    fn trim_keeps_system_messages() {
        let messages = vec![
            json!({"role": "system", "content": "sys"}),
            json!({"role": "user", "content": "hi"}),
        ];
        let trimmed = trim_messages(&messages);
        assert_eq!(trimmed[0]["role"], "system");
    }

    #[test]
    fn trim_drops_tool_messages_from_older_prefix() {
        let mut messages = vec![json!({"role": "system", "content": "sys"})];
        for i in 0..20 {
            messages.push(json!({"role": "user", "content": format!("msg {i}")}));
            messages.push(json!({"role": "tool", "tool_call_id": format!("t{i}"), "content": "result"}));
        }
        let trimmed = trim_messages(&messages);
        let protected_tail_len = ((40.0 * 0.3).ceil() as usize).max(10);
        let older_tool_count = trimmed
            .iter()
            .rev()
            .skip(protected_tail_len)
            .filter(|m| m["role"] == "tool")
            .count();
        assert_eq!(older_tool_count, 0);
    }

    #[test]
    fn trim_truncates_long_assistant_text_in_older_prefix() {
        let long_text = "x".repeat(600);
        let mut messages = vec![json!({"role": "system", "content": "sys"})];
        messages.push(json!({"role": "assistant", "content": long_text}));
        for i in 0..15 {
            messages.push(json!({"role": "user", "content": format!("recent {i}")}));
        }
        let trimmed = trim_messages(&messages);
        let assistant = trimmed
            .iter()
            .find(|m| m["role"] == "assistant")
            .expect("assistant message survives");
        let text = assistant["content"].as_str().unwrap();
        assert!(text.ends_with("...[trimmed]"));
        assert!(text.len() < 600);
    }

    #[test]
    fn drop_orphaned_tool_messages_removes_unmatched() {
        let messages = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "tool", "tool_call_id": "missing", "content": "x"}),
        ];
        let result = drop_orphaned_tool_messages(messages);
        assert_eq!(result.len(), 1);
    }
}
