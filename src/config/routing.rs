//! Scenario routing configuration for P-Routing.
//!
//! Each scenario (`background`, `think`, `longContext`) may be routed to a
//! distinct upstream profile; anything not covered falls back to the entry
//! profile's own upstream.

use serde::Deserialize;
use std::collections::HashMap;

/// Where a classified request scenario should be forwarded.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioRoute {
    /// Base URL of the target upstream (another proxy instance or a
    /// distinct provider profile).
    pub base_url: String,

    /// Environment variable to read the auth token from, injected as
    /// `x-api-key`/`anthropic-api-key` on the forwarded request.
    #[serde(default)]
    pub auth_token_env: Option<String>,
}

/// Routing configuration, as read from the `[routing]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileRoutingConfig {
    pub enabled: Option<bool>,
    pub long_context_threshold: Option<u64>,
    #[serde(default)]
    pub scenarios: HashMap<String, ScenarioRoute>,
}

/// Effective routing configuration handed to `proxy::routing`.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub enabled: bool,
    pub long_context_threshold: u64,
    pub scenarios: HashMap<String, ScenarioRoute>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            long_context_threshold: 60_000,
            scenarios: HashMap::new(),
        }
    }
}

impl RoutingConfig {
    pub fn from_file(file: Option<FileRoutingConfig>) -> Self {
        let Some(file) = file else {
            return Self::default();
        };
        Self {
            enabled: file.enabled.unwrap_or(false),
            long_context_threshold: file.long_context_threshold.unwrap_or(60_000),
            scenarios: file.scenarios,
        }
    }

    pub fn route_for(&self, scenario: &str) -> Option<&ScenarioRoute> {
        self.scenarios.get(scenario)
    }
}
