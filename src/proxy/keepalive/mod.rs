//! P-Keepalive: a long-lived daemon that fronts the remote Anthropic
//! endpoint, forwards every request verbatim, captures the cacheable
//! prefix, and periodically replays a tiny ping to hold the upstream
//! prompt cache warm while the client is idle.

pub mod stats;

use crate::config::Config;
use crate::proxy::error::ProxyError;
use crate::proxy::{bind, build_upstream_client, run_server};
use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Router,
};
use serde_json::Value;
use stats::{hash_prefix, CapturedPrefix, Stats, UsageDelta};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const PING_TIMEOUT_SECS: u64 = 30;
const STATS_DEBOUNCE_SECS: u64 = 30;

#[derive(Clone)]
struct KeepaliveState {
    client: reqwest::Client,
    upstream_base: String,
    keepalive_ms: u64,
    auto_exit_ms: u64,
    stats_path: PathBuf,
    prefix: Arc<Mutex<Option<CapturedPrefix>>>,
    stats: Arc<Mutex<Stats>>,
    /// Bumped on every client/ping activity; a scheduled ping/auto-exit task
    /// compares its captured generation against the current one to tell
    /// whether it should still fire or has been superseded.
    generation: Arc<AtomicU64>,
}

pub async fn serve(
    config: Config,
    addr_tx: tokio::sync::oneshot::Sender<SocketAddr>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let stats_path = config.keepalive.stats_path.clone();
    let restored = Stats::load_from(&stats_path);
    let mut stats = Stats::default();
    stats.merge(restored);

    let state = KeepaliveState {
        client: build_upstream_client()?,
        upstream_base: config.api_url.trim_end_matches('/').to_string(),
        keepalive_ms: config.keepalive.keepalive_ms,
        auto_exit_ms: config.keepalive.auto_exit_ms,
        stats_path,
        prefix: Arc::new(Mutex::new(None)),
        stats: Arc::new(Mutex::new(stats)),
        generation: Arc::new(AtomicU64::new(0)),
    };

    schedule_auto_exit(state.clone());
    spawn_stats_persistence(state.clone());

    let app = Router::new()
        .route("/health", get(health))
        .route("/_health", get(full_health))
        .route("/_stats", get(full_health))
        .route("/_stop", post(stop))
        .route("/*path", any(forward))
        .with_state(state.clone());

    let listener = bind(config.bind_addr).await?;
    let local_addr = listener.local_addr().context("failed to read local address")?;
    let _ = addr_tx.send(local_addr);

    // Flush stats synchronously the moment a shutdown signal arrives,
    // rather than waiting on the debounce timer, then let the graceful
    // shutdown proceed as usual.
    let (flushed_shutdown_tx, flushed_shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = shutdown_rx.await;
        if let Ok(stats) = state.stats.lock() {
            let _ = stats.save_to(&state.stats_path);
        }
        tracing::info!("keepalive flushed stats on shutdown");
        let _ = flushed_shutdown_tx.send(());
    });

    run_server(listener, app, flushed_shutdown_rx).await
}

async fn health(State(state): State<KeepaliveState>) -> Response {
    axum::Json(serde_json::json!({
        "service": "cache-keepalive",
        "status": "ok",
        "upstream": state.upstream_base,
    }))
    .into_response()
}

async fn full_health(State(state): State<KeepaliveState>) -> Response {
    let stats = state.stats.lock().unwrap();
    axum::Json(serde_json::json!({
        "service": "cache-keepalive",
        "status": "ok",
        "upstream": state.upstream_base,
        "reqs": stats.reqs,
        "pings": stats.pings,
        "ok": stats.ok,
        "errs": stats.errs,
        "cacheRead": stats.cache_read,
        "cacheWrite": stats.cache_write,
        "input": stats.input,
        "output": stats.output,
        "prefixChanges": stats.prefix_changes,
        "perModel": stats.per_model,
        "recentChanges": stats.recent_changes,
        "costEstimate": stats.cost_estimate(),
        "cacheHitRate": stats.cache_hit_rate(),
    }))
    .into_response()
}

async fn stop(State(state): State<KeepaliveState>) -> Response {
    if let Ok(stats) = state.stats.lock() {
        let _ = stats.save_to(&state.stats_path);
    }
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::process::exit(0);
    });
    axum::Json(serde_json::json!({"status": "stopping"})).into_response()
}

async fn forward(State(state): State<KeepaliveState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();

    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return ProxyError::payload_too_large("request body exceeds 10 MiB").into_response(),
    };

    if path == "/v1/messages" {
        capture_prefix(&state, &body_bytes, &parts.headers);
    }

    state.generation.fetch_add(1, Ordering::SeqCst);
    schedule_ping(state.clone());

    let url = format!("{}{}{}", state.upstream_base, path, query);
    let mut builder = state.client.request(parts.method.clone(), &url);
    builder = builder.headers(forwardable_headers(&parts.headers));
    builder = builder.body(body_bytes.to_vec());

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => return ProxyError::upstream_network(e.to_string()).into_response(),
    };

    let status = upstream.status();
    let headers = upstream.headers().clone();
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return ProxyError::upstream_network(e.to_string()).into_response(),
    };

    if path == "/v1/messages" {
        let model = request_model(&body_bytes).unwrap_or_else(|| "unknown".to_string());
        let usage = extract_usage(&bytes);
        let mut stats = state.stats.lock().unwrap();
        stats.record_request(&model, &usage);
    }

    let mut resp_builder = Response::builder().status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK));
    for (name, value) in headers.iter() {
        resp_builder = resp_builder.header(name, value);
    }
    resp_builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| ProxyError::Internal("failed to build response".into()).into_response())
}

fn request_model(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(str::to_string)
}

fn capture_prefix(state: &KeepaliveState, body: &[u8], headers: &HeaderMap) {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return;
    };
    let Some(model) = value.get("model").and_then(|v| v.as_str()) else {
        return;
    };

    let system = value.get("system").and_then(system_as_text);
    let tools = value.get("tools").cloned();
    let hash = hash_prefix(model, system.as_deref(), tools.as_ref());

    let api_key = headers
        .get("x-api-key")
        .or_else(|| headers.get("authorization"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let api_version = headers
        .get("anthropic-version")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let api_beta = headers
        .get("anthropic-beta")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut prefix_guard = state.prefix.lock().unwrap();
    let previous_hash = prefix_guard.as_ref().map(|p| p.hash.clone());

    *prefix_guard = Some(CapturedPrefix {
        model: model.to_string(),
        system,
        tools,
        api_key,
        api_version,
        api_beta,
        hash: hash.clone(),
    });
    drop(prefix_guard);

    let mut stats = state.stats.lock().unwrap();
    stats.record_prefix_change(previous_hash, &hash, model, now_millis());
}

fn system_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let joined: Vec<String> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()).map(str::to_string))
                .collect();
            Some(joined.join("\n"))
        }
        _ => None,
    }
}

fn extract_usage(sse_body: &bytes::Bytes) -> UsageDelta {
    let text = String::from_utf8_lossy(sse_body);
    let mut usage = UsageDelta::default();
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        if let Some(message_usage) = value.pointer("/message/usage") {
            usage.cache_read = message_usage
                .get("cache_read_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(usage.cache_read);
            usage.cache_write = message_usage
                .get("cache_creation_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(usage.cache_write);
            usage.input = message_usage
                .get("input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(usage.input);
        }
        if let Some(delta_usage) = value.get("usage").filter(|_| value.get("type").and_then(|t| t.as_str()) == Some("message_delta")) {
            usage.output = delta_usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(usage.output);
        }
    }
    usage
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

/// Reschedule the single-slot keepalive ping timer. Each call bumps the
/// generation counter; the sleeping task checks it on wake and no-ops if a
/// newer request has since rescheduled it, so at most one ping is ever
/// pending.
fn schedule_ping(state: KeepaliveState) {
    let my_generation = state.generation.load(Ordering::SeqCst);
    let delay = Duration::from_millis(state.keepalive_ms);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if state.generation.load(Ordering::SeqCst) != my_generation {
            return;
        }
        send_ping(&state).await;
        schedule_ping(state);
    });
}

async fn send_ping(state: &KeepaliveState) {
    let prefix = state.prefix.lock().unwrap().clone();
    let Some(prefix) = prefix else {
        return;
    };

    let mut body = serde_json::json!({
        "model": prefix.model,
        "max_tokens": 1,
        "stream": true,
        "messages": [{"role": "user", "content": "ping"}],
    });
    if let Some(system) = &prefix.system {
        body["system"] = Value::String(system.clone());
    }
    if let Some(tools) = &prefix.tools {
        body["tools"] = tools.clone();
    }

    let url = format!("{}/v1/messages", state.upstream_base);
    let mut builder = state
        .client
        .post(&url)
        .timeout(Duration::from_secs(PING_TIMEOUT_SECS))
        .json(&body);
    if let Some(key) = &prefix.api_key {
        builder = builder.header("x-api-key", key.clone());
    }
    if let Some(version) = &prefix.api_version {
        builder = builder.header("anthropic-version", version.clone());
    }
    if let Some(beta) = &prefix.api_beta {
        builder = builder.header("anthropic-beta", beta.clone());
    }

    let result = builder.send().await;
    let mut usage = UsageDelta::default();
    let success = match result {
        Ok(resp) if resp.status().is_success() => {
            if let Ok(bytes) = resp.bytes().await {
                usage = extract_usage(&bytes);
            }
            true
        }
        _ => false,
    };

    let mut stats = state.stats.lock().unwrap();
    stats.record_ping(&prefix.model, success, &usage);
}

/// Independent idle-shutdown timer: flush stats, and exit cleanly if no
/// activity has bumped the generation counter since this task last checked.
fn schedule_auto_exit(state: KeepaliveState) {
    tokio::spawn(async move {
        loop {
            let generation_before = state.generation.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(state.auto_exit_ms)).await;
            if state.generation.load(Ordering::SeqCst) == generation_before {
                if let Ok(stats) = state.stats.lock() {
                    let _ = stats.save_to(&state.stats_path);
                }
                tracing::info!("keepalive daemon auto-exiting after idle period");
                std::process::exit(0);
            }
        }
    });
}

fn spawn_stats_persistence(state: KeepaliveState) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(STATS_DEBOUNCE_SECS)).await;
            if let Ok(stats) = state.stats.lock() {
                let _ = stats.save_to(&state.stats_path);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_usage_reads_message_start_and_delta() {
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"cache_read_input_tokens\":5,\"cache_creation_input_tokens\":2,\"input_tokens\":10}}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n\n",
        );
        let usage = extract_usage(&bytes::Bytes::from(sse));
        assert_eq!(usage.cache_read, 5);
        assert_eq!(usage.cache_write, 2);
        assert_eq!(usage.input, 10);
        assert_eq!(usage.output, 7);
    }

    #[test]
    fn system_as_text_joins_blocks() {
        let value = serde_json::json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]);
        assert_eq!(system_as_text(&value), Some("a\nb".to_string()));
    }

    #[test]
    fn request_model_reads_field() {
        let body = serde_json::json!({"model": "claude-x"});
        assert_eq!(request_model(body.to_string().as_bytes()), Some("claude-x".to_string()));
    }
}
