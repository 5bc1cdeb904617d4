//! P-Routing: classifies each Anthropic request into a scenario and
//! re-targets it to a per-scenario upstream. Non-`/v1/messages` and
//! non-POST requests go straight to the default upstream unchanged.

use crate::config::routing::ScenarioRoute;
use crate::config::Config;
use crate::proxy::error::ProxyError;
use crate::proxy::{bind, build_upstream_client, run_server};
use crate::tokens::estimate_json_tokens;
use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use serde_json::Value;
use std::net::SocketAddr;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Background,
    Think,
    LongContext,
    Default,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Background => "background",
            Scenario::Think => "think",
            Scenario::LongContext => "longContext",
            Scenario::Default => "default",
        }
    }
}

/// Classify a parsed Anthropic request body per the detection rules.
pub fn classify(body: &Value, config: &crate::config::RoutingConfig) -> Scenario {
    if let Some(model) = body.get("model").and_then(|v| v.as_str()) {
        let lower = model.to_lowercase();
        if lower.contains("claude") && lower.contains("haiku") {
            return Scenario::Background;
        }
    }

    if body
        .get("thinking")
        .and_then(|t| t.get("type"))
        .and_then(|v| v.as_str())
        == Some("enabled")
    {
        return Scenario::Think;
    }

    if config.enabled {
        let estimated = estimate_json_tokens(body);
        if estimated as u64 > config.long_context_threshold {
            return Scenario::LongContext;
        }
    }

    Scenario::Default
}

#[derive(Clone)]
struct RoutingState {
    client: reqwest::Client,
    default_upstream: String,
    routing: crate::config::RoutingConfig,
}

pub async fn serve(
    config: Config,
    addr_tx: tokio::sync::oneshot::Sender<SocketAddr>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let state = RoutingState {
        client: build_upstream_client()?,
        default_upstream: config.api_url.trim_end_matches('/').to_string(),
        routing: config.routing.clone(),
    };

    let app = Router::new().route("/*path", any(forward)).with_state(state);

    let listener = bind(config.bind_addr).await?;
    let local_addr = listener.local_addr().context("failed to read local address")?;
    let _ = addr_tx.send(local_addr);
    run_server(listener, app, shutdown_rx).await
}

async fn forward(State(state): State<RoutingState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();

    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return ProxyError::payload_too_large("request body exceeds 10 MiB").into_response(),
    };

    let target = if parts.method == axum::http::Method::POST && path == "/v1/messages" {
        match serde_json::from_slice::<Value>(&body_bytes) {
            Ok(parsed) => {
                let scenario = classify(&parsed, &state.routing);
                tracing::debug!(scenario = scenario.as_str(), "routed request");
                route_for(&state, scenario)
            }
            Err(_) => None,
        }
    } else {
        None
    };

    let base = target
        .map(|route: &ScenarioRoute| route.base_url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| state.default_upstream.clone());

    let url = format!("{base}{path}{query}");
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

    let mut resp_builder = Response::builder().status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK));
    for (name, value) in headers.iter() {
        resp_builder = resp_builder.header(name, value);
    }
    resp_builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| ProxyError::Internal("failed to build response".into()).into_response())
}

fn route_for(state: &RoutingState, scenario: Scenario) -> Option<&ScenarioRoute> {
    if scenario == Scenario::Default {
        return None;
    }
    state.routing.route_for(scenario.as_str())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;

    #[test]
    fn classifies_background_from_haiku_model() {
        let body = serde_json::json!({"model": "claude-haiku-4-5-20251001"});
        let config = RoutingConfig::default();
        assert_eq!(classify(&body, &config), Scenario::Background);
    }

    #[test]
    fn classifies_think_from_thinking_config() {
        let body = serde_json::json!({"model": "claude-x", "thinking": {"type": "enabled"}});
        let config = RoutingConfig::default();
        assert_eq!(classify(&body, &config), Scenario::Think);
    }

    #[test]
    fn classifies_default_when_nothing_matches() {
        let body = serde_json::json!({"model": "claude-sonnet"});
        let config = RoutingConfig::default();
        assert_eq!(classify(&body, &config), Scenario::Default);
    }

    #[test]
    fn think_takes_priority_over_long_context_when_both_could_apply() {
        let mut config = RoutingConfig::default();
        config.enabled = true;
        config.long_context_threshold = 1;
        let body = serde_json::json!({
            "model": "claude-x",
            "thinking": {"type": "enabled"},
            "messages": [{"role": "user", "content": "a very long message indeed".repeat(50)}],
        });
        assert_eq!(classify(&body, &config), Scenario::Think);
    }
}
