//! Translation context - carries state from request to response translation
//!
//! The `TranslationContext` is created once per client request and threaded
//! through every chunk of the corresponding response. It owns the SSE line
//! buffer, the open-content-block bookkeeping, and the per-tool-call index
//! table needed to translate either upstream dialect back into the Anthropic
//! event sequence described in the data model.

use crate::proxy::sanitize_names::ToolNameMap;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Model Mapping
// ============================================================================

/// Model name mapping from the model the client requested to the model sent
/// upstream.
///
/// Config format:
/// ```toml
/// [translation.model_mapping]
/// "haiku" = "xai/grok-code-fast"
/// "sonnet" = "openai/gpt-5.1"
/// "opus" = "amazon/nova-2-lite-v1:free"
/// ```
///
/// Supports partial matching: "haiku" matches "claude-haiku-4-5-20251001".
#[derive(Debug, Clone, Default)]
pub struct ModelMapping {
    /// client pattern -> upstream model
    client_to_upstream: HashMap<String, String>,
    /// upstream model -> client pattern (reverse direction, for completeness)
    upstream_to_client: HashMap<String, String>,
}

impl ModelMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HashMap<String, String>) -> Self {
        let mut mapping = Self::new();
        for (client_pattern, upstream_model) in config {
            mapping.add(client_pattern.clone(), upstream_model.clone());
        }
        mapping
    }

    pub fn add(&mut self, client_pattern: String, upstream_model: String) {
        self.upstream_to_client
            .insert(upstream_model.clone(), client_pattern.clone());
        self.client_to_upstream.insert(client_pattern, upstream_model);
    }

    /// Map the client's model name to the upstream model name.
    ///
    /// Exact match wins; otherwise the first config pattern that's a
    /// substring of the (lowercased) client model wins; otherwise passthrough.
    pub fn to_upstream(&self, client_model: &str) -> String {
        if let Some(target) = self.client_to_upstream.get(client_model) {
            return target.clone();
        }

        let model_lower = client_model.to_lowercase();
        for (pattern, target) in &self.client_to_upstream {
            if model_lower.contains(&pattern.to_lowercase()) {
                return target.clone();
            }
        }

        client_model.to_string()
    }

    /// Map an upstream model name back to what the client should see.
    pub fn to_client(&self, upstream_model: &str) -> String {
        self.upstream_to_client
            .get(upstream_model)
            .cloned()
            .unwrap_or_else(|| upstream_model.to_string())
    }
}

// ============================================================================
// Open content block tracking
// ============================================================================

/// What kind of Anthropic content block is currently open on the client-facing
/// stream, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBlock {
    Text,
    Thinking,
    ToolUse,
}

/// State for one tool call being streamed from the upstream.
#[derive(Debug, Clone, Default)]
pub struct ToolCallState {
    pub id: String,
    pub name: String,
    /// Anthropic content_block index this tool call was assigned
    pub block_index: u32,
    pub started: bool,
}

// ============================================================================
// Translation Context
// ============================================================================

/// Per-request/per-stream state threaded through response translation.
#[derive(Debug, Clone)]
pub struct TranslationContext {
    /// Model mapping for bidirectional name translation
    pub model_mapping: Arc<ModelMapping>,

    /// Original model name the client asked for (echoed back in responses)
    pub original_model: Option<String>,

    /// Whether the client requested streaming (`stream: true`)
    pub streaming: bool,

    /// Request id for correlation/logging
    pub request_id: Option<String>,

    /// Buffer for incomplete SSE lines that span chunk boundaries
    pub line_buffer: String,

    /// Next Anthropic content_block index to assign
    pub next_block_index: u32,

    /// Currently open content block, if any
    pub open_block: Option<OpenBlock>,

    /// Whether `message_start` has already been emitted
    pub sent_message_start: bool,

    /// Tool calls seen so far, keyed by the upstream's per-call index
    /// (Chat Completions dialect) or call_id (Responses dialect)
    pub tool_calls: HashMap<String, ToolCallState>,

    /// Accumulated output text, for fallback token estimation
    pub accumulated_content: String,

    /// Finish/stop reason observed on the stream so far
    pub stop_reason: Option<String>,

    /// Input/output token counts, updated as usage arrives
    pub input_tokens: u64,
    pub output_tokens: u64,

    /// Response id reported by a Responses-API upstream (chaining state)
    pub upstream_response_id: Option<String>,

    /// Whether any tool call was observed (affects final stop_reason)
    pub saw_tool_call: bool,

    /// Short -> original tool name mapping built while translating the
    /// request, consulted while translating the response.
    pub tool_name_map: ToolNameMap,

    /// Set once `message_stop` has been emitted, so `finalize` is idempotent.
    pub finished: bool,
}

impl TranslationContext {
    pub fn new(model_mapping: Arc<ModelMapping>, streaming: bool) -> Self {
        Self {
            model_mapping,
            original_model: None,
            streaming,
            request_id: None,
            line_buffer: String::new(),
            next_block_index: 0,
            open_block: None,
            sent_message_start: false,
            tool_calls: HashMap::new(),
            accumulated_content: String::new(),
            stop_reason: None,
            input_tokens: 0,
            output_tokens: 0,
            upstream_response_id: None,
            saw_tool_call: false,
            tool_name_map: ToolNameMap::new(),
            finished: false,
        }
    }

    pub fn with_tool_name_map(mut self, map: ToolNameMap) -> Self {
        self.tool_name_map = map;
        self
    }

    pub fn with_original_model(mut self, model: String) -> Self {
        self.original_model = Some(model);
        self
    }

    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Allocate a fresh content_block index and mark it open.
    pub fn open_new_block(&mut self, kind: OpenBlock) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some(kind);
        index
    }

    pub fn close_open_block(&mut self) {
        self.open_block = None;
    }

    /// The model name to echo back to the client.
    pub fn response_model_name(&self, upstream_model: Option<&str>) -> String {
        if let Some(ref original) = self.original_model {
            return original.clone();
        }
        if let Some(upstream) = upstream_model {
            return self.model_mapping.to_client(upstream);
        }
        "unknown".to_string()
    }
}

/// Generate a unique Anthropic message id (`msg_...`), stable for the
/// lifetime of one streamed response.
pub fn generate_message_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    format!("msg_{:x}", timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_mapping_passthrough() {
        let mapping = ModelMapping::new();
        assert_eq!(
            mapping.to_upstream("claude-haiku-4-5-20251001"),
            "claude-haiku-4-5-20251001"
        );
        assert_eq!(mapping.to_client("gpt-4"), "gpt-4");
    }

    #[test]
    fn model_mapping_partial_match() {
        let mut config = HashMap::new();
        config.insert("haiku".to_string(), "xai/grok-code-fast".to_string());
        config.insert("sonnet".to_string(), "openai/gpt-5.1".to_string());

        let mapping = ModelMapping::from_config(&config);

        assert_eq!(
            mapping.to_upstream("claude-haiku-4-5-20251001"),
            "xai/grok-code-fast"
        );
        assert_eq!(mapping.to_upstream("some-random-model"), "some-random-model");
    }

    #[test]
    fn model_mapping_exact_match_priority() {
        let mut config = HashMap::new();
        config.insert(
            "claude-haiku-4-5-20251001".to_string(),
            "exact-target".to_string(),
        );
        config.insert("haiku".to_string(), "partial-target".to_string());

        let mapping = ModelMapping::from_config(&config);
        assert_eq!(
            mapping.to_upstream("claude-haiku-4-5-20251001"),
            "exact-target"
        );
    }

    #[test]
    fn context_block_indices_increase() {
        let mut ctx = TranslationContext::new(Arc::new(ModelMapping::new()), true);
        let a = ctx.open_new_block(OpenBlock::Text);
        ctx.close_open_block();
        let b = ctx.open_new_block(OpenBlock::ToolUse);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn message_id_has_prefix() {
        assert!(generate_message_id().starts_with("msg_"));
    }
}
