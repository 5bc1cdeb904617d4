// relay-proxy - loopback proxy pipeline for an Anthropic-Messages-speaking
// coding-assistant CLI.
//
// Exactly one of four cooperating proxy components runs per process,
// selected by `Config::component`:
// - P-Translate:  Anthropic <-> OpenAI (Chat Completions or Responses) bridge
// - P-Sanitize:   transparent forwarder that rewrites tool names
// - P-Keepalive:  prompt-cache keepalive daemon
// - P-Routing:    scenario classifier and re-targeter
//
// The bound loopback address is what the caller hands to the child CLI as
// `ANTHROPIC_BASE_URL`.

mod cli;
mod config;
mod logging;
mod pricing;
mod proxy;
mod tokens;

use anyhow::Result;
use config::Config;
use std::process::ExitCode;

const EXIT_GENERAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_PORT_CONFLICT: u8 = 8;
const EXIT_ABORT: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    if cli::handle_cli() {
        return ExitCode::SUCCESS;
    }

    Config::ensure_config_exists();
    let config = Config::from_env();

    let _guard = match logging::init(&config.logging, &config.log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    print_startup_banner(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            let code = classify_exit_code(&e);
            ExitCode::from(code)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let (addr_tx, addr_rx) = tokio::sync::oneshot::channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let component = config.component;
    let proxy_handle = tokio::spawn(proxy::run(config, addr_tx, shutdown_rx));

    if let Ok(addr) = addr_rx.await {
        tracing::info!(component = component.as_str(), %addr, "proxy ready");
    }

    tokio::select! {
        result = proxy_handle => {
            result.map_err(|e| anyhow::anyhow!("proxy task panicked: {e}"))?
        }
        signal_result = tokio::signal::ctrl_c() => {
            signal_result?;
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(());
            Err(anyhow::anyhow!("interrupted"))
        }
        _ = wait_for_sigterm() => {
            tracing::info!("received SIGTERM, shutting down");
            let _ = shutdown_tx.send(());
            Err(anyhow::anyhow!("interrupted"))
        }
    }
}

/// Waits for SIGTERM on Unix; never resolves on platforms without it, so the
/// `ctrl_c` arm is still the only signal path there.
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

fn classify_exit_code(err: &anyhow::Error) -> u8 {
    let message = err.to_string().to_lowercase();
    if message.contains("interrupted") {
        EXIT_ABORT
    } else if message.contains("bind") || message.contains("address already in use") {
        EXIT_PORT_CONFLICT
    } else if message.contains("config") {
        EXIT_CONFIG
    } else {
        EXIT_GENERAL
    }
}

fn print_startup_banner(config: &Config) {
    eprintln!(
        "relay-proxy v{} starting ({} component, bind {})",
        config::VERSION,
        config.component.as_str(),
        config.bind_addr
    );
    tracing::info!(
        version = config::VERSION,
        component = config.component.as_str(),
        bind = %config.bind_addr,
        "starting relay-proxy"
    );
}
