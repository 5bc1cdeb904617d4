//! Translators for the two OpenAI-compatible wire dialects this proxy speaks
//! upstream: Chat Completions and Responses.

pub mod chat_request;
pub mod chat_response;
pub mod responses_request;
pub mod responses_response;

/// Format an Anthropic SSE event as `event: <type>\ndata: <json>\n\n`.
pub(crate) fn format_sse_event<T: serde::Serialize>(
    event_type: &str,
    data: &T,
) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_string(data)?;
    Ok(format!("event: {}\ndata: {}\n\n", event_type, json).into_bytes())
}

/// Convert an OpenAI `finish_reason` to an Anthropic `stop_reason`.
pub(crate) fn convert_finish_reason(finish_reason: &str) -> String {
    match finish_reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" => "tool_use".to_string(),
        "content_filter" => "end_turn".to_string(),
        _ => "end_turn".to_string(),
    }
}
