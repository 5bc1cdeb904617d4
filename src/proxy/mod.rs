//! Proxy module - the four loopback HTTP components described in the
//! system overview, plus the translation layer and helpers they share.
//!
//! Exactly one component runs per process (selected by `Config::component`);
//! `run` is the single entry point `main.rs` calls after loading config.

pub mod count_tokens;
pub mod error;
pub mod keepalive;
pub mod retry;
pub mod routing;
pub mod sanitize;
pub mod sanitize_names;
pub mod translate;
pub mod translation;

use crate::config::{ComponentKind, Config};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Build the shared HTTP client used to talk to upstream providers.
///
/// HTTP/1.1 is forced: some providers reset HTTP/2 connections when the
/// client sends unusual header casing, and there is no benefit to
/// multiplexing here since each component serves one local CLI.
pub(crate) fn build_upstream_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(120_000))
        .pool_max_idle_per_host(16)
        .http1_only()
        .build()
        .context("failed to build upstream HTTP client")
}

/// Bind `addr`, log the resolved local address (important when `:0` was
/// requested for an ephemeral port), and return the listener.
pub(crate) async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local = listener.local_addr().context("failed to read local address")?;
    tracing::info!(addr = %local, "proxy listening");
    Ok(listener)
}

/// Serve `app` on `listener` until `shutdown_rx` fires, then return once all
/// in-flight connections have drained.
pub(crate) async fn run_server(
    listener: TcpListener,
    app: axum::Router,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("proxy server error")?;
    tracing::info!("proxy shut down gracefully");
    Ok(())
}

/// Start whichever component `config.component` selects and run until
/// `shutdown_rx` fires. The bound local address is sent over `addr_tx` as
/// soon as the listener is up, so the caller can hand it to the child CLI
/// as `ANTHROPIC_BASE_URL` before the proxy has finished serving.
pub async fn run(
    config: Config,
    addr_tx: tokio::sync::oneshot::Sender<SocketAddr>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    match config.component {
        ComponentKind::Translate => translate::serve(config, addr_tx, shutdown_rx).await,
        ComponentKind::Sanitize => sanitize::serve(config, addr_tx, shutdown_rx).await,
        ComponentKind::Keepalive => keepalive::serve(config, addr_tx, shutdown_rx).await,
        ComponentKind::Routing => routing::serve(config, addr_tx, shutdown_rx).await,
    }
}
