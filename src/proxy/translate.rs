//! P-Translate: the Anthropic <-> OpenAI protocol proxy.
//!
//! Accepts only Anthropic-shaped `/v1/messages` (with an optional
//! `/api/provider/<name>` path prefix), `.../count_tokens`, `GET /v1/models`
//! and `GET /`. Everything else is a 404.

use crate::config::{Config, DialectChoice};
use crate::proxy::error::ProxyError;
use crate::proxy::retry::{self, backoff_delay, unauthorized_retry_delay};
use crate::proxy::translation::{Dialect, ModelMapping, TranslationContext, TranslationPipeline};
use crate::proxy::{bind, build_upstream_client, count_tokens, run_server};
use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
struct TranslateState {
    client: reqwest::Client,
    pipeline: Arc<TranslationPipeline>,
    dialect: Dialect,
    fallback_enabled: bool,
    upstream_base: String,
    /// Shared across the process lifetime so upstream caching can key on it.
    session_id: Arc<String>,
    last_response_id: Arc<Mutex<Option<String>>>,
}

pub async fn serve(
    config: Config,
    addr_tx: tokio::sync::oneshot::Sender<SocketAddr>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let client = build_upstream_client()?;
    let model_mapping = ModelMapping::from_config(&config.translation.model_mapping);
    let pipeline = Arc::new(TranslationPipeline::new(model_mapping));
    let dialect = match config.translation.dialect {
        DialectChoice::Chat => Dialect::Chat,
        DialectChoice::Responses => Dialect::Responses,
    };

    let state = TranslateState {
        client,
        pipeline,
        dialect,
        fallback_enabled: config.translation.auto_detect && dialect == Dialect::Chat,
        upstream_base: normalize_base_url(&config.api_url),
        session_id: Arc::new(generate_session_id()),
        last_response_id: Arc::new(Mutex::new(None)),
    };

    let app = Router::new()
        .route("/", get(health))
        .route("/v1/models", get(models))
        .route("/*path", post(messages))
        .with_state(state);

    let listener = bind(config.bind_addr).await?;
    let local_addr = listener.local_addr().context("failed to read local address")?;
    let _ = addr_tx.send(local_addr);
    run_server(listener, app, shutdown_rx).await
}

fn generate_session_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("relay-{:x}", nanos)
}

/// Strip a trailing slash and a trailing `/v1` from a configured upstream
/// base URL; P-Translate appends its own dialect-specific path.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    trimmed.strip_suffix("/v1").unwrap_or(trimmed).to_string()
}

/// `/api/provider/<name>` is stripped before matching the remaining routes.
fn strip_provider_prefix(path: &str) -> &str {
    if let Some(rest) = path.strip_prefix("/api/provider/") {
        if let Some(idx) = rest.find('/') {
            return &rest[idx..];
        }
        return "/";
    }
    path
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok", "proxy": "anthropic-to-openai"}))
}

async fn models(State(state): State<TranslateState>) -> Response {
    let url = format!("{}/v1/models", state.upstream_base);
    match state.client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let bytes = resp.bytes().await.unwrap_or_default();
            if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                if let Some(normalized) = normalize_model_list(&value) {
                    return axum::Json(normalized).into_response();
                }
            }
            Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(bytes))
                .unwrap_or_else(|_| ProxyError::Internal("failed to build response".into()).into_response())
        }
        Err(e) => ProxyError::upstream_network(e.to_string()).into_response(),
    }
}

/// Reshape an OpenAI-style `{data:[{id,...}]}` model list into the Anthropic
/// shape. Returns `None` if `value` doesn't look like a model list at all,
/// so the caller can fall through to forwarding the raw upstream body.
fn normalize_model_list(value: &Value) -> Option<Value> {
    let items = value.get("data")?.as_array()?;
    let models: Vec<Value> = items
        .iter()
        .filter_map(|item| {
            let id = item.get("id")?.as_str()?.to_string();
            Some(serde_json::json!({
                "type": "model",
                "id": id,
                "display_name": id,
                "created_at": item.get("created").cloned().unwrap_or(Value::Null),
            }))
        })
        .collect();
    let first_id = models.first().and_then(|m| m.get("id").cloned());
    let last_id = models.last().and_then(|m| m.get("id").cloned());
    Some(serde_json::json!({
        "data": models,
        "first_id": first_id,
        "last_id": last_id,
        "has_more": false,
    }))
}

async fn messages(State(state): State<TranslateState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = strip_provider_prefix(parts.uri.path()).to_string();

    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return ProxyError::payload_too_large("request body exceeds 10 MiB").into_response(),
    };

    if count_tokens::is_count_tokens_path(&path) {
        return handle_count_tokens(&body_bytes).into_response();
    }

    if path != "/v1/messages" {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    let parsed: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(_) => return ProxyError::bad_request("Invalid JSON").into_response(),
    };
    let client_streaming = parsed.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    match handle_translation(&state, &body_bytes, &parts.headers, client_streaming).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

fn handle_count_tokens(body_bytes: &[u8]) -> Response {
    match serde_json::from_slice::<Value>(body_bytes) {
        Ok(body) => {
            let tokens = count_tokens::estimate(&body);
            axum::Json(serde_json::json!({ "input_tokens": tokens })).into_response()
        }
        Err(_) => ProxyError::bad_request("Invalid JSON").into_response(),
    }
}

async fn handle_translation(
    state: &TranslateState,
    body_bytes: &[u8],
    headers: &HeaderMap,
    client_streaming: bool,
) -> Result<Response, ProxyError> {
    let mut dialect = state.dialect;
    let mut attempted_fallback = false;
    let mut body_bytes = body_bytes.to_vec();
    let mut chained = { state.last_response_id.lock().unwrap().clone() };
    let mut network_retried = false;
    let mut unauthorized_retried = false;
    let mut overflow_retried = false;
    let mut stale_chain_retried = false;

    loop {
        let translator = state.pipeline.request_translator(dialect);
        let (upstream_body, mut ctx) = translator
            .translate(&body_bytes, headers, chained.as_deref(), state.session_id.as_str())
            .map_err(|e| ProxyError::bad_request(e.to_string()))?;
        ctx.streaming = true; // upstream is always asked to stream

        let url = format!("{}{}", state.upstream_base, dialect.endpoint_path());
        let upstream_result = post_upstream(state, &url, &upstream_body, headers, dialect).await;

        let upstream_resp = match upstream_result {
            Ok(resp) => resp,
            Err(e) => {
                let message = e.to_string();
                if !network_retried && retry::is_retryable_network_error(&message) {
                    network_retried = true;
                    let reset = message.to_lowercase().contains("reset");
                    tokio::time::sleep(backoff_delay(reset)).await;
                    continue;
                }
                if state.fallback_enabled && !attempted_fallback {
                    attempted_fallback = true;
                    dialect = Dialect::Responses;
                    continue;
                }
                return Err(ProxyError::upstream_network(message));
            }
        };

        let status = upstream_resp.status();

        if status == StatusCode::UNAUTHORIZED && !unauthorized_retried {
            unauthorized_retried = true;
            tokio::time::sleep(unauthorized_retry_delay()).await;
            continue;
        }

        if !status.is_success() {
            let error_body = upstream_resp.bytes().await.unwrap_or_default();
            let error_text = String::from_utf8_lossy(&error_body).to_string();

            if !overflow_retried && retry::is_context_overflow(&error_text) {
                overflow_retried = true;
                chained = None;
                *state.last_response_id.lock().unwrap() = None;
                body_bytes = trim_body(&body_bytes);
                continue;
            }

            if chained.is_some() && !stale_chain_retried {
                stale_chain_retried = true;
                chained = None;
                continue;
            }

            if retry::is_retryable_status(status.as_u16()) && !network_retried {
                network_retried = true;
                tokio::time::sleep(backoff_delay(false)).await;
                continue;
            }

            if state.fallback_enabled && !attempted_fallback {
                attempted_fallback = true;
                dialect = Dialect::Responses;
                continue;
            }

            return Err(ProxyError::upstream_status(status, error_text));
        }

        if !client_streaming {
            let body = upstream_resp
                .bytes()
                .await
                .map_err(|e| ProxyError::upstream_network(e.to_string()))?;
            let translated = state
                .pipeline
                .response_translator(dialect)
                .translate_buffered(&body, &mut ctx)
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            if let Some(id) = ctx.upstream_response_id.clone() {
                *state.last_response_id.lock().unwrap() = Some(id);
            }
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(translated))
                .map_err(|e| ProxyError::Internal(e.to_string()))?);
        }

        return Ok(stream_response(state.clone(), dialect, upstream_resp, ctx));
    }
}

async fn post_upstream(
    state: &TranslateState,
    url: &str,
    body: &[u8],
    client_headers: &HeaderMap,
    dialect: Dialect,
) -> reqwest::Result<reqwest::Response> {
    let auth = client_headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").to_string())
        .or_else(|| {
            client_headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
        .unwrap_or_default();

    let mut builder = state
        .client
        .post(url)
        .header("authorization", format!("Bearer {auth}"))
        .header("accept", "text/event-stream")
        .header("user-agent", "relay-proxy/1.0")
        .body(body.to_vec());

    if dialect == Dialect::Responses {
        builder = builder
            .header("x-session-id", state.session_id.as_str())
            .header("conversation_id", state.session_id.as_str())
            .header("session_id", state.session_id.as_str());
    }

    builder.send().await
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

struct StreamState {
    inner: ByteStream,
    ctx: TranslationContext,
    done: bool,
}

/// Translate the upstream SSE body chunk-by-chunk as it arrives, emitting
/// Anthropic-shaped SSE to the client. If the upstream connection closes
/// before the stream reached its own terminal event, `finalize` is invoked
/// so the client still sees a clean `message_delta` + `message_stop`.
fn stream_response(
    state: TranslateState,
    dialect: Dialect,
    upstream: reqwest::Response,
    ctx: TranslationContext,
) -> Response {
    let pipeline = state.pipeline.clone();
    let last_response_id = state.last_response_id.clone();

    let initial = StreamState {
        inner: Box::pin(upstream.bytes_stream()),
        ctx,
        done: false,
    };

    let translated = stream::unfold(initial, move |mut st| {
        let pipeline = pipeline.clone();
        let last_response_id = last_response_id.clone();
        async move {
            if st.done {
                return None;
            }
            let translator = pipeline.response_translator(dialect);
            let out = match st.inner.next().await {
                Some(Ok(bytes)) => translator.translate_chunk(&bytes, &mut st.ctx).unwrap_or_else(|e| {
                    tracing::error!(error = %e, "translation error mid-stream");
                    Vec::new()
                }),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "upstream stream error");
                    let message = format!("[upstream_error] {e}");
                    let synthetic = format_synthetic_error(&message);
                    let mut out = translator
                        .translate_chunk(synthetic.as_bytes(), &mut st.ctx)
                        .unwrap_or_default();
                    out.extend(translator.finalize(&mut st.ctx).unwrap_or_default());
                    st.done = true;
                    out
                }
                None => {
                    let out = if st.ctx.finished {
                        Vec::new()
                    } else {
                        translator.finalize(&mut st.ctx).unwrap_or_default()
                    };
                    st.done = true;
                    out
                }
            };
            if st.ctx.finished {
                if let Some(id) = st.ctx.upstream_response_id.clone() {
                    *last_response_id.lock().unwrap() = Some(id);
                }
            }
            Some((Ok::<_, std::convert::Infallible>(bytes::Bytes::from(out)), st))
        }
    });

    let body = Body::from_stream(translated);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .unwrap_or_else(|_| ProxyError::Internal("failed to build streaming response".into()).into_response())
}

fn format_synthetic_error(message: &str) -> String {
    format!("event: error\ndata: {}\n\n", serde_json::json!({"error": {"message": message}}))
}

fn trim_body(body: &[u8]) -> Vec<u8> {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.to_vec();
    };
    if let Some(messages) = value.get("messages").and_then(|m| m.as_array()) {
        let trimmed = retry::trim_messages(messages);
        value["messages"] = Value::Array(trimmed);
    }
    serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_provider_prefix() {
        assert_eq!(
            strip_provider_prefix("/api/provider/openrouter/v1/messages"),
            "/v1/messages"
        );
        assert_eq!(strip_provider_prefix("/v1/messages"), "/v1/messages");
    }

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("https://api.example.com/v1/"), "https://api.example.com");
        assert_eq!(normalize_base_url("https://api.example.com"), "https://api.example.com");
    }

    #[test]
    fn normalizes_model_list() {
        let upstream = serde_json::json!({"data": [{"id": "gpt-4", "created": 1}]});
        let normalized = normalize_model_list(&upstream).unwrap();
        assert_eq!(normalized["data"][0]["type"], "model");
        assert_eq!(normalized["first_id"], "gpt-4");
        assert_eq!(normalized["has_more"], false);
    }

    #[test]
    fn non_model_list_returns_none() {
        assert!(normalize_model_list(&serde_json::json!({"foo": "bar"})).is_none());
    }
}
