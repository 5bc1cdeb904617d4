//! Tracing initialization.
//!
//! Precedence for the filter directive: `RUST_LOG` env var > `config.logging`
//! > a built-in default. There is no TUI here to protect, so this is a
//! straightforward `fmt`/`json` layer over stdout plus a rotating file
//! appender under `log_dir`.

use crate::config::LoggingConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber. The returned guard must be
/// held for the lifetime of the process - dropping it stops the background
/// flush thread for the file appender.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    let default_filter = format!("relay_proxy={},tower_http=warn", config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "relay-proxy.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .json();

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(file_layer)
            .init();
    }

    Ok(guard)
}
