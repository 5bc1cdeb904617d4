//! `count_tokens` endpoint handling.
//!
//! Unlike the general-purpose estimator in `crate::tokens`, this is the
//! literal contract the `/v1/messages/count_tokens` endpoint promises: an
//! estimate derived purely from the serialized request body, without
//! contacting the upstream at all.

use serde_json::Value;

/// `ceil(len(JSON.stringify(body.messages || body)) / 4)`
pub fn estimate(body: &Value) -> u64 {
    let subject = body.get("messages").unwrap_or(body);
    let serialized = subject.to_string();
    ((serialized.len() as f64) / 4.0).ceil() as u64
}

/// Whether a request path is the `count_tokens` endpoint (with or without a
/// `/api/provider/<name>` prefix).
pub fn is_count_tokens_path(path: &str) -> bool {
    path.ends_with("/count_tokens")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn is_count_tokens_path_matches_suffix() {
        assert!(is_count_tokens_path("/v1/messages/count_tokens"));
        assert!(is_count_tokens_path(
            "/api/provider/openrouter/v1/messages/count_tokens"
        ));
        assert!(!is_count_tokens_path("/v1/messages"));
    }

    #[test]
    fn estimate_uses_messages_field_when_present() {
        let body = json!({
            "model": "claude-x",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let expected =
            (json!([{"role": "user", "content": "hi"}]).to_string().len() as f64 / 4.0).ceil()
                as u64;
        assert_eq!(estimate(&body), expected);
    }

    #[test]
    fn estimate_falls_back_to_whole_body() {
        let body = json!({"foo": "bar"});
        let expected = (body.to_string().len() as f64 / 4.0).ceil() as u64;
        assert_eq!(estimate(&body), expected);
    }

    #[test]
    fn estimate_is_at_least_one_for_nonempty_body() {
        let body = json!({});
        assert!(estimate(&body) >= 1);
    }
}
