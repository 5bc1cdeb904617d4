//! Configuration for the proxy components.
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (`~/.config/relay-proxy/config.toml`)
//! 3. Built-in defaults (lowest priority)
//!
//! `Config` is loaded exactly once at process startup. Each component (see
//! `proxy::translate`, `proxy::sanitize`, `proxy::keepalive`,
//! `proxy::routing`) is handed only the slice of `Config` it needs, built as
//! an explicit struct at startup — components never read environment
//! variables themselves.

mod routing;

#[cfg(test)]
mod tests;

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

pub use routing::{FileRoutingConfig, RoutingConfig, ScenarioRoute};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Component selection
// ─────────────────────────────────────────────────────────────────────────────

/// Which proxy component this process runs. A single binary invocation
/// starts exactly one of these.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Anthropic <-> OpenAI protocol translation proxy.
    #[default]
    Translate,
    /// Tool-name sanitizing pass-through.
    Sanitize,
    /// Prompt-cache keepalive daemon.
    Keepalive,
    /// Scenario classifier / router.
    Routing,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Translate => "translate",
            Self::Sanitize => "sanitize",
            Self::Keepalive => "keepalive",
            Self::Routing => "routing",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "translate" => Some(Self::Translate),
            "sanitize" => Some(Self::Sanitize),
            "keepalive" => Some(Self::Keepalive),
            "routing" => Some(Self::Routing),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Translation dialect
// ─────────────────────────────────────────────────────────────────────────────

/// Which upstream wire dialect P-Translate speaks, independent of
/// `proxy::translation::Dialect` so config never depends on proxy internals.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DialectChoice {
    #[default]
    Chat,
    Responses,
}

impl DialectChoice {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "responses" => Some(Self::Responses),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileTranslationConfig {
    pub enabled: Option<bool>,
    pub dialect: Option<String>,
    pub auto_detect: Option<bool>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub dialect: DialectChoice,
    pub auto_detect: bool,
    pub model_mapping: HashMap<String, String>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dialect: DialectChoice::Chat,
            auto_detect: false,
            model_mapping: HashMap::new(),
        }
    }
}

impl TranslationConfig {
    fn from_file(file: Option<FileTranslationConfig>) -> Self {
        let Some(file) = file else {
            return Self::default();
        };
        let dialect = file
            .dialect
            .as_deref()
            .and_then(DialectChoice::parse)
            .unwrap_or_default();
        Self {
            enabled: file.enabled.unwrap_or(true),
            dialect,
            auto_detect: file.auto_detect.unwrap_or(false),
            model_mapping: file.model_mapping,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Keepalive
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FileKeepaliveConfig {
    pub keepalive_ms: Option<u64>,
    pub auto_exit_ms: Option<u64>,
    pub stats_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub keepalive_ms: u64,
    pub auto_exit_ms: u64,
    pub stats_path: PathBuf,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            keepalive_ms: 240_000,
            auto_exit_ms: 600_000,
            stats_path: std::env::temp_dir().join("relay-proxy-keepalive-stats.json"),
        }
    }
}

impl KeepaliveConfig {
    fn from_file(file: Option<FileKeepaliveConfig>) -> Self {
        let Some(file) = file else {
            return Self::default();
        };
        let default = Self::default();
        Self {
            keepalive_ms: file.keepalive_ms.unwrap_or(default.keepalive_ms),
            auto_exit_ms: file.auto_exit_ms.unwrap_or(default.auto_exit_ms),
            stats_path: file
                .stats_path
                .map(PathBuf::from)
                .unwrap_or(default.stats_path),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sanitize
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileSanitizeConfig {
    pub warn_on_sanitize: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct SanitizeConfig {
    pub warn_on_sanitize: bool,
}

impl SanitizeConfig {
    fn from_file(file: Option<FileSanitizeConfig>) -> Self {
        Self {
            warn_on_sanitize: file.and_then(|f| f.warn_on_sanitize).unwrap_or(false),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileLoggingConfig {
    pub level: Option<String>,
    pub json: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn from_file(file: Option<FileLoggingConfig>) -> Self {
        let Some(file) = file else {
            return Self::default();
        };
        let default = Self::default();
        Self {
            level: file.level.unwrap_or(default.level),
            json: file.json.unwrap_or(default.json),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the active component's listener to.
    pub bind_addr: SocketAddr,

    /// Which component this process runs.
    pub component: ComponentKind,

    /// Upstream API base URL (Anthropic or an OpenAI-compatible backend).
    pub api_url: String,

    /// Directory for log/PID/stats files.
    pub log_dir: PathBuf,

    pub logging: LoggingConfig,
    pub translation: TranslationConfig,
    pub keepalive: KeepaliveConfig,
    pub routing: RoutingConfig,
    pub sanitize: SanitizeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            component: ComponentKind::default(),
            api_url: "https://api.anthropic.com".to_string(),
            log_dir: std::env::temp_dir().join("relay-proxy"),
            logging: LoggingConfig::default(),
            translation: TranslationConfig::default(),
            keepalive: KeepaliveConfig::default(),
            routing: RoutingConfig::default(),
            sanitize: SanitizeConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub component: Option<String>,
    pub api_url: Option<String>,
    pub log_dir: Option<String>,
    pub logging: Option<FileLoggingConfig>,
    pub translation: Option<FileTranslationConfig>,
    pub keepalive: Option<FileKeepaliveConfig>,
    pub routing: Option<FileRoutingConfig>,
    pub sanitize: Option<FileSanitizeConfig>,
}

impl Config {
    /// `~/.config/relay-proxy/config.toml`
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("relay-proxy").join("config.toml"))
    }

    /// Render the current config as a TOML template, used both for
    /// `config --reset` and to seed a missing config file on startup.
    pub fn to_toml(&self) -> String {
        format!(
            "# relay-proxy configuration\n\
             bind_addr = \"{bind_addr}\"\n\
             component = \"{component}\"\n\
             api_url = \"{api_url}\"\n\
             log_dir = \"{log_dir}\"\n\
             \n\
             [logging]\n\
             level = \"{log_level}\"\n\
             json = {log_json}\n\
             \n\
             [translation]\n\
             enabled = {t_enabled}\n\
             dialect = \"{t_dialect}\"\n\
             auto_detect = {t_auto}\n\
             \n\
             [translation.model_mapping]\n\
             # \"haiku\" = \"gpt-4o-mini\"\n\
             \n\
             [keepalive]\n\
             keepalive_ms = {k_ka}\n\
             auto_exit_ms = {k_exit}\n\
             \n\
             [routing]\n\
             enabled = {r_enabled}\n\
             long_context_threshold = {r_threshold}\n\
             \n\
             [sanitize]\n\
             warn_on_sanitize = {s_warn}\n",
            bind_addr = self.bind_addr,
            component = self.component.as_str(),
            api_url = self.api_url,
            log_dir = self.log_dir.display(),
            log_level = self.logging.level,
            log_json = self.logging.json,
            t_enabled = self.translation.enabled,
            t_dialect = match self.translation.dialect {
                DialectChoice::Chat => "chat",
                DialectChoice::Responses => "responses",
            },
            t_auto = self.translation.auto_detect,
            k_ka = self.keepalive.keepalive_ms,
            k_exit = self.keepalive.auto_exit_ms,
            r_enabled = self.routing.enabled,
            r_threshold = self.routing.long_context_threshold,
            s_warn = self.sanitize.warn_on_sanitize,
        )
    }

    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("CONFIG ERROR: failed to parse {}: {}", path.display(), e);
                std::process::exit(2);
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("CONFIG ERROR: cannot read {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
    }

    /// Load configuration: env vars > config file > defaults.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let default = Self::default();

        let bind_addr = std::env::var("RELAY_BIND")
            .ok()
            .or(file.bind_addr)
            .unwrap_or_else(|| default.bind_addr.to_string())
            .parse()
            .expect("Invalid bind address");

        let component = std::env::var("RELAY_COMPONENT")
            .ok()
            .and_then(|v| ComponentKind::parse(&v))
            .or_else(|| file.component.as_deref().and_then(ComponentKind::parse))
            .unwrap_or(default.component);

        let api_url = std::env::var("ANTHROPIC_API_URL")
            .ok()
            .or(file.api_url)
            .unwrap_or(default.api_url);

        let log_dir = std::env::var("RELAY_LOG_DIR")
            .ok()
            .or(file.log_dir)
            .map(PathBuf::from)
            .unwrap_or(default.log_dir);

        Self {
            bind_addr,
            component,
            api_url,
            log_dir,
            logging: LoggingConfig::from_file(file.logging),
            translation: TranslationConfig::from_file(file.translation),
            keepalive: KeepaliveConfig::from_file(file.keepalive),
            routing: RoutingConfig::from_file(file.routing),
            sanitize: SanitizeConfig::from_file(file.sanitize),
        }
    }
}
