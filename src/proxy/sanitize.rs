//! P-Sanitize: a transparent forwarding proxy that rewrites tool names.
//!
//! Every request is forwarded byte-for-byte except that JSON bodies at
//! `/v1/messages` have `tools[].name` and `content[].tool_use.name`
//! sanitized; the reverse mapping is then applied to `tool_use` block names
//! in the streamed response. Anything that doesn't parse is forwarded
//! untouched rather than dropped - this proxy never corrupts a well-formed
//! body it can't understand.

use crate::config::Config;
use crate::proxy::error::ProxyError;
use crate::proxy::sanitize_names::ToolNameMap;
use crate::proxy::{bind, build_upstream_client, run_server};
use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
struct SanitizeState {
    client: reqwest::Client,
    upstream_base: String,
    warn_on_sanitize: bool,
    names: Arc<Mutex<ToolNameMap>>,
}

pub async fn serve(
    config: Config,
    addr_tx: tokio::sync::oneshot::Sender<SocketAddr>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let state = SanitizeState {
        client: build_upstream_client()?,
        upstream_base: config.api_url.trim_end_matches('/').to_string(),
        warn_on_sanitize: config.sanitize.warn_on_sanitize,
        names: Arc::new(Mutex::new(ToolNameMap::new())),
    };

    let app = Router::new().route("/*path", any(forward)).with_state(state);

    let listener = bind(config.bind_addr).await?;
    let local_addr = listener.local_addr().context("failed to read local address")?;
    let _ = addr_tx.send(local_addr);
    run_server(listener, app, shutdown_rx).await
}

async fn forward(State(state): State<SanitizeState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();

    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return ProxyError::payload_too_large("request body exceeds 10 MiB").into_response(),
    };

    let outgoing_body = if path == "/v1/messages" {
        sanitize_request_body(&body_bytes, &state)
    } else {
        body_bytes.to_vec()
    };

    let url = format!("{}{}{}", state.upstream_base, path, query);
    let mut builder = state.client.request(parts.method.clone(), &url);
    builder = builder.headers(forwardable_headers(&parts.headers));
    builder = builder.body(outgoing_body);

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => return ProxyError::upstream_network(e.to_string()).into_response(),
    };

    let status = upstream.status();
    let response_headers = upstream.headers().clone();
    let is_sse = response_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    let mut resp_builder = Response::builder().status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK));
    for (name, value) in response_headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        resp_builder = resp_builder.header(name, value);
    }

    let body = if is_sse && path == "/v1/messages" {
        Body::from_stream(rewrite_sse_stream(upstream.bytes_stream(), state.names.clone()))
    } else {
        match upstream.bytes().await {
            Ok(bytes) => Body::from(bytes),
            Err(e) => return ProxyError::upstream_network(e.to_string()).into_response(),
        }
    };

    resp_builder
        .body(body)
        .unwrap_or_else(|_| ProxyError::Internal("failed to build response".into()).into_response())
}

fn sanitize_request_body(body_bytes: &[u8], state: &SanitizeState) -> Vec<u8> {
    let Ok(mut value) = serde_json::from_slice::<Value>(body_bytes) else {
        return body_bytes.to_vec();
    };

    let mut names = state.names.lock().unwrap();

    if let Some(tools) = value.get_mut("tools").and_then(|t| t.as_array_mut()) {
        for tool in tools.iter_mut() {
            sanitize_field(tool, "name", &mut names, state.warn_on_sanitize);
        }
    }

    if let Some(messages) = value.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for message in messages.iter_mut() {
            if let Some(blocks) = message.get_mut("content").and_then(|c| c.as_array_mut()) {
                for block in blocks.iter_mut() {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        sanitize_field(block, "name", &mut names, state.warn_on_sanitize);
                    }
                }
            }
        }
    }

    serde_json::to_vec(&value).unwrap_or_else(|_| body_bytes.to_vec())
}

fn sanitize_field(obj: &mut Value, field: &str, names: &mut ToolNameMap, warn: bool) {
    let Some(original) = obj.get(field).and_then(|v| v.as_str()).map(|s| s.to_string()) else {
        return;
    };
    let sanitized = names.sanitize(&original);
    if sanitized != original {
        if warn {
            tracing::warn!(original, sanitized, "sanitized tool name");
        }
        obj[field] = Value::String(sanitized);
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

/// Rewrite `content_block_start` events whose block is a `tool_use` so the
/// client sees the original tool name again. Everything else passes through
/// unmodified; a line that doesn't parse as the expected shape is forwarded
/// as-is rather than dropped.
fn rewrite_sse_stream(
    inner: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
    names: Arc<Mutex<ToolNameMap>>,
) -> impl Stream<Item = Result<bytes::Bytes, std::convert::Infallible>> {
    let boxed: ByteStream = Box::pin(inner);
    stream::unfold((boxed, String::new()), move |(mut inner, mut buffer)| {
        let names = names.clone();
        async move {
            let chunk = inner.next().await?;
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(_) => return Some((Ok(bytes::Bytes::new()), (inner, buffer))),
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            let rewritten = rewrite_buffered_lines(&mut buffer, &names);
            Some((Ok(bytes::Bytes::from(rewritten)), (inner, buffer)))
        }
    })
}

fn rewrite_buffered_lines(buffer: &mut String, names: &Arc<Mutex<ToolNameMap>>) -> String {
    let mut out = String::new();
    while let Some(idx) = buffer.find("\n\n") {
        let event: String = buffer.drain(..idx + 2).collect();
        out.push_str(&rewrite_sse_event(&event, names));
    }
    out
}

fn rewrite_sse_event(event: &str, names: &Arc<Mutex<ToolNameMap>>) -> String {
    let mut result = String::with_capacity(event.len());
    for line in event.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n');
        if let Some(data) = trimmed.strip_prefix("data: ") {
            if let Ok(mut value) = serde_json::from_str::<Value>(data) {
                if value.get("type").and_then(|t| t.as_str()) == Some("content_block_start") {
                    if let Some(block) = value.get_mut("content_block") {
                        if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                            if let Some(short) = block.get("name").and_then(|n| n.as_str()).map(str::to_string) {
                                let original = names.lock().unwrap().resolve(&short);
                                block["name"] = Value::String(original);
                            }
                        }
                    }
                    let rewritten = serde_json::to_string(&value).unwrap_or_else(|_| data.to_string());
                    result.push_str("data: ");
                    result.push_str(&rewritten);
                    result.push('\n');
                    continue;
                }
            }
        }
        result.push_str(line);
    }
    result
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) || name == axum::http::header::HOST {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailer"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_request_body_rewrites_tool_names() {
        let state = SanitizeState {
            client: reqwest::Client::new(),
            upstream_base: "https://example.com".to_string(),
            warn_on_sanitize: false,
            names: Arc::new(Mutex::new(ToolNameMap::new())),
        };
        let body = serde_json::json!({
            "tools": [{"name": "mcp__github__create_issue_with_very_long_description_suffix_here"}]
        });
        let out = sanitize_request_body(body.to_string().as_bytes(), &state);
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let sanitized_name = parsed["tools"][0]["name"].as_str().unwrap();
        assert!(sanitized_name.starts_with("mcp_"));
        assert_eq!(sanitized_name.len(), "mcp_".len() + 12);
    }

    #[test]
    fn sanitize_request_body_passes_through_already_valid_names() {
        let state = SanitizeState {
            client: reqwest::Client::new(),
            upstream_base: "https://example.com".to_string(),
            warn_on_sanitize: false,
            names: Arc::new(Mutex::new(ToolNameMap::new())),
        };
        let body = serde_json::json!({"tools": [{"name": "get_weather"}]});
        let out = sanitize_request_body(body.to_string().as_bytes(), &state);
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["tools"][0]["name"], "get_weather");
    }

    #[test]
    fn rewrite_sse_event_reverses_tool_use_name() {
        let names = Arc::new(Mutex::new(ToolNameMap::new()));
        let short = names.lock().unwrap().sanitize("mcp__github__create_issue");
        let event = format!(
            "data: {}\n\n",
            serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t1", "name": short}})
        );
        let rewritten = rewrite_sse_event(&event, &names);
        assert!(rewritten.contains("mcp__github__create_issue"));
    }

    #[test]
    fn rewrite_sse_event_passes_through_non_tool_use() {
        let names = Arc::new(Mutex::new(ToolNameMap::new()));
        let event = "data: {\"type\":\"message_start\"}\n\n".to_string();
        let rewritten = rewrite_sse_event(&event, &names);
        assert_eq!(rewritten, event);
    }
}
