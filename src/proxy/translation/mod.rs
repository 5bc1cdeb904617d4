//! API translation - converts between the Anthropic Messages API (always
//! spoken by the client) and an OpenAI-compatible upstream, in either of its
//! two dialects.
//!
//! # Architecture
//!
//! ```text
//! Anthropic request (client)
//!     ↓
//! RequestTranslator  (Chat or Responses dialect, picked by config)
//!     ↓
//! [upstream OpenAI-compatible endpoint]
//!     ↓
//! ResponseTranslator (same dialect)
//!     ↓
//! Anthropic SSE / JSON response (client)
//! ```
//!
//! Unlike a general-purpose format bridge, the client side of this proxy is
//! fixed: every request we accept is Anthropic-shaped. The only thing that
//! varies is which OpenAI dialect we speak to the backend, so there is no
//! format-detection step - `Dialect` is picked once from configuration and a
//! fallback may additionally be attempted per the retry policy.

pub mod context;
pub mod openai;

pub use context::{ModelMapping, OpenBlock, TranslationContext};

use axum::http::HeaderMap;

/// Which OpenAI-compatible wire dialect the upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// `/v1/chat/completions`, `choices[].delta`
    Chat,
    /// `/v1/responses`, `response.*` events, stateful via `previous_response_id`
    Responses,
}

impl Dialect {
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Dialect::Chat => "/v1/chat/completions",
            Dialect::Responses => "/v1/responses",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Chat => "chat-completions",
            Dialect::Responses => "responses",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Converts an Anthropic request body into an upstream request body.
pub trait RequestTranslator: Send + Sync {
    fn name(&self) -> &'static str;
    fn dialect(&self) -> Dialect;

    /// `chained` carries the prior `previous_response_id` when the caller is
    /// continuing a Responses-API conversation; ignored by the Chat dialect.
    /// `session_id` is the stable per-client-connection identifier used as
    /// `prompt_cache_key` in Responses mode; ignored by the Chat dialect.
    fn translate(
        &self,
        body: &[u8],
        headers: &HeaderMap,
        chained: Option<&str>,
        session_id: &str,
    ) -> anyhow::Result<(Vec<u8>, TranslationContext)>;
}

/// Converts an upstream response (buffered or streamed) back into the
/// Anthropic shape.
pub trait ResponseTranslator: Send + Sync {
    fn name(&self) -> &'static str;
    fn dialect(&self) -> Dialect;

    /// Translate a complete buffered (non-streaming) upstream response.
    fn translate_buffered(&self, body: &[u8], ctx: &mut TranslationContext) -> anyhow::Result<Vec<u8>>;

    /// Translate one chunk of upstream SSE bytes into zero or more Anthropic
    /// SSE events. `ctx` carries state across calls for the lifetime of one
    /// stream; the line buffer absorbs partial events split across chunks.
    fn translate_chunk(&self, chunk: &[u8], ctx: &mut TranslationContext) -> anyhow::Result<Vec<u8>>;

    /// Emit the terminal `message_delta` + `message_stop` pair once the
    /// upstream stream ends (including on early/abnormal termination).
    fn finalize(&self, ctx: &mut TranslationContext) -> anyhow::Result<Vec<u8>>;
}

/// Holds one request/response translator pair per dialect and hands out the
/// pair selected by configuration.
pub struct TranslationPipeline {
    request_translators: Vec<Box<dyn RequestTranslator>>,
    response_translators: Vec<Box<dyn ResponseTranslator>>,
    model_mapping: std::sync::Arc<ModelMapping>,
}

impl TranslationPipeline {
    pub fn new(model_mapping: ModelMapping) -> Self {
        let model_mapping = std::sync::Arc::new(model_mapping);
        Self {
            request_translators: vec![
                Box::new(openai::chat_request::AnthropicToChatRequest::new(
                    model_mapping.clone(),
                )),
                Box::new(openai::responses_request::AnthropicToResponsesRequest::new(
                    model_mapping.clone(),
                )),
            ],
            response_translators: vec![
                Box::new(openai::chat_response::ChatToAnthropicResponse::new()),
                Box::new(openai::responses_response::ResponsesToAnthropicResponse::new()),
            ],
            model_mapping,
        }
    }

    pub fn model_mapping(&self) -> std::sync::Arc<ModelMapping> {
        self.model_mapping.clone()
    }

    pub fn request_translator(&self, dialect: Dialect) -> &dyn RequestTranslator {
        self.request_translators
            .iter()
            .find(|t| t.dialect() == dialect)
            .map(|t| t.as_ref())
            .expect("a request translator is registered for every Dialect variant")
    }

    pub fn response_translator(&self, dialect: Dialect) -> &dyn ResponseTranslator {
        self.response_translators
            .iter()
            .find(|t| t.dialect() == dialect)
            .map(|t| t.as_ref())
            .expect("a response translator is registered for every Dialect variant")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_endpoint_paths() {
        assert_eq!(Dialect::Chat.endpoint_path(), "/v1/chat/completions");
        assert_eq!(Dialect::Responses.endpoint_path(), "/v1/responses");
    }

    #[test]
    fn pipeline_has_both_dialects() {
        let pipeline = TranslationPipeline::new(ModelMapping::new());
        assert_eq!(pipeline.request_translator(Dialect::Chat).dialect(), Dialect::Chat);
        assert_eq!(
            pipeline.request_translator(Dialect::Responses).dialect(),
            Dialect::Responses
        );
        assert_eq!(
            pipeline.response_translator(Dialect::Chat).dialect(),
            Dialect::Chat
        );
    }
}
