//! Anthropic -> OpenAI Chat Completions request translation.
//!
//! | Anthropic                       | OpenAI Chat Completions           |
//! |----------------------------------|-----------------------------------|
//! | Top-level `system` field         | `messages[].role: "system"`       |
//! | `tool_use` / `tool_result` blocks | `tool_calls` / `role: "tool"`     |
//! | `thinking.budget_tokens`          | `reasoning.max_tokens`            |

use crate::proxy::sanitize_names::ToolNameMap;
use crate::proxy::translation::{
    context::ModelMapping, Dialect, RequestTranslator, TranslationContext,
};
use anyhow::{Context, Result};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct AnthropicToChatRequest {
    model_mapping: Arc<ModelMapping>,
}

impl AnthropicToChatRequest {
    pub fn new(model_mapping: Arc<ModelMapping>) -> Self {
        Self { model_mapping }
    }
}

impl RequestTranslator for AnthropicToChatRequest {
    fn name(&self) -> &'static str {
        "anthropic-to-chat-completions-request"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Chat
    }

    fn translate(
        &self,
        body: &[u8],
        _headers: &HeaderMap,
        _chained: Option<&str>,
        _session_id: &str,
    ) -> Result<(Vec<u8>, TranslationContext)> {
        let anthropic_request: AnthropicRequest = serde_json::from_slice(body).map_err(|e| {
            let body_preview = String::from_utf8_lossy(&body[..body.len().min(500)]);
            tracing::error!(
                "failed to parse Anthropic request: {} | body preview: {}...",
                e,
                body_preview
            );
            anyhow::anyhow!("Failed to parse Anthropic request: {}", e)
        })?;

        let mut tool_name_map = ToolNameMap::new();
        let mut openai_messages: Vec<OpenAiMessage> = Vec::new();

        if let Some(system) = &anthropic_request.system {
            let system_text = match system {
                SystemPrompt::Text(text) => text.clone(),
                SystemPrompt::Blocks(blocks) => blocks
                    .iter()
                    .map(|b| match b {
                        SystemBlock::Text { text } => text.as_str(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            if !system_text.is_empty() {
                openai_messages.push(OpenAiMessage {
                    role: "system".to_string(),
                    content: Some(OpenAiContent::Text(system_text)),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }

        for msg in &anthropic_request.messages {
            openai_messages.extend(convert_message(msg, &mut tool_name_map));
        }

        let openai_model = self.model_mapping.to_upstream(&anthropic_request.model);

        let reasoning = anthropic_request
            .thinking
            .as_ref()
            .map(|t| ReasoningConfig {
                max_tokens: t.budget_tokens,
            });

        let openai_request = OpenAiChatRequest {
            model: openai_model,
            messages: openai_messages,
            max_tokens: anthropic_request.max_tokens,
            temperature: anthropic_request.temperature,
            top_p: anthropic_request.top_p,
            stop: anthropic_request.stop_sequences,
            // Upstream is always asked to stream; the proxy synthesizes a
            // buffered response for clients that didn't request it.
            stream: Some(true),
            tools: anthropic_request.tools.map(|tools| {
                tools
                    .into_iter()
                    .map(|t| convert_tool(t, &mut tool_name_map))
                    .collect()
            }),
            tool_choice: anthropic_request
                .tool_choice
                .map(|c| convert_tool_choice(c, &mut tool_name_map)),
            reasoning,
        };

        let translated_body =
            serde_json::to_vec(&openai_request).context("Failed to serialize OpenAI request")?;

        let ctx = TranslationContext::new(
            self.model_mapping.clone(),
            anthropic_request.stream.unwrap_or(false),
        )
        .with_original_model(anthropic_request.model.clone())
        .with_tool_name_map(tool_name_map);

        tracing::debug!(
            "translated Anthropic request: model={} -> {}, messages={}",
            anthropic_request.model,
            openai_request.model,
            openai_request.messages.len()
        );

        Ok((translated_body, ctx))
    }
}

// ============================================================================
// Anthropic Request Types (Input - Deserialize)
// ============================================================================

#[derive(Debug, Deserialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(default)]
    system: Option<SystemPrompt>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(default)]
    tool_choice: Option<AnthropicToolChoice>,
    #[serde(default)]
    thinking: Option<ThinkingConfig>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    top_k: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SystemBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct ThinkingConfig {
    #[serde(default)]
    #[allow(dead_code)]
    r#type: Option<String>,
    #[serde(default)]
    budget_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[allow(dead_code)]
        thinking: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Blocks(Vec<ToolResultBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ToolResultBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct ImageSource {
    #[serde(rename = "type")]
    _source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicToolChoice {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "tool")]
    Tool { name: String },
    #[serde(rename = "none")]
    None,
}

// ============================================================================
// OpenAI Request Types (Output - Serialize)
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<OpenAiToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningConfig>,
}

#[derive(Debug, Serialize)]
struct ReasoningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OpenAiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiToolChoice {
    Mode(String),
    Specific {
        #[serde(rename = "type")]
        choice_type: String,
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Serialize)]
struct ToolChoiceFunction {
    name: String,
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// A single Anthropic message may produce multiple OpenAI messages: a
/// `tool_result` block becomes a separate `role: "tool"` message.
fn convert_message(msg: &AnthropicMessage, tool_name_map: &mut ToolNameMap) -> Vec<OpenAiMessage> {
    match &msg.content {
        AnthropicContent::Text(text) => {
            vec![OpenAiMessage {
                role: msg.role.clone(),
                content: Some(OpenAiContent::Text(text.clone())),
                tool_calls: None,
                tool_call_id: None,
            }]
        }
        AnthropicContent::Blocks(blocks) => {
            let mut messages: Vec<OpenAiMessage> = Vec::new();
            let mut text_parts: Vec<String> = Vec::new();
            let mut image_parts: Vec<OpenAiContentPart> = Vec::new();
            let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();

            for block in blocks {
                match block {
                    AnthropicContentBlock::Text { text } => {
                        text_parts.push(text.clone());
                    }
                    AnthropicContentBlock::Image { source } => {
                        let data_url = format!("data:{};base64,{}", source.media_type, source.data);
                        image_parts.push(OpenAiContentPart::ImageUrl {
                            image_url: ImageUrl { url: data_url },
                        });
                    }
                    AnthropicContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(OpenAiToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: OpenAiFunctionCall {
                                name: tool_name_map.sanitize(name),
                                arguments: serde_json::to_string(input).unwrap_or_default(),
                            },
                        });
                    }
                    AnthropicContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => {
                        let result_text = content
                            .as_ref()
                            .map(|c| match c {
                                ToolResultContent::Text(text) => text.clone(),
                                ToolResultContent::Blocks(blocks) => blocks
                                    .iter()
                                    .map(|b| match b {
                                        ToolResultBlock::Text { text } => text.as_str(),
                                    })
                                    .collect::<Vec<_>>()
                                    .join("\n"),
                            })
                            .unwrap_or_default();

                        messages.push(OpenAiMessage {
                            role: "tool".to_string(),
                            content: Some(OpenAiContent::Text(result_text)),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        });
                    }
                    AnthropicContentBlock::Thinking { .. } => {}
                }
            }

            if !text_parts.is_empty() || !image_parts.is_empty() || !tool_calls.is_empty() {
                let content = if !image_parts.is_empty() {
                    let mut parts: Vec<OpenAiContentPart> = text_parts
                        .into_iter()
                        .map(|text| OpenAiContentPart::Text { text })
                        .collect();
                    parts.extend(image_parts);
                    Some(OpenAiContent::Parts(parts))
                } else if !text_parts.is_empty() {
                    Some(OpenAiContent::Text(text_parts.join("")))
                } else {
                    None
                };

                messages.insert(
                    0,
                    OpenAiMessage {
                        role: msg.role.clone(),
                        content,
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        tool_call_id: None,
                    },
                );
            }

            if messages.is_empty() {
                messages.push(OpenAiMessage {
                    role: msg.role.clone(),
                    content: Some(OpenAiContent::Text(String::new())),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }

            messages
        }
    }
}

fn convert_tool(tool: AnthropicTool, tool_name_map: &mut ToolNameMap) -> OpenAiTool {
    OpenAiTool {
        tool_type: "function".to_string(),
        function: OpenAiFunction {
            name: tool_name_map.sanitize(&tool.name),
            description: tool.description,
            parameters: Some(tool.input_schema),
        },
    }
}

fn convert_tool_choice(
    choice: AnthropicToolChoice,
    tool_name_map: &mut ToolNameMap,
) -> OpenAiToolChoice {
    match choice {
        AnthropicToolChoice::Auto => OpenAiToolChoice::Mode("auto".to_string()),
        AnthropicToolChoice::Any => OpenAiToolChoice::Mode("required".to_string()),
        AnthropicToolChoice::None => OpenAiToolChoice::Mode("none".to_string()),
        AnthropicToolChoice::Tool { name } => OpenAiToolChoice::Specific {
            choice_type: "function".to_string(),
            function: ToolChoiceFunction {
                name: tool_name_map.sanitize(&name),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_translator() -> AnthropicToChatRequest {
        AnthropicToChatRequest::new(Arc::new(ModelMapping::new()))
    }

    #[test]
    fn simple_request_translation() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let anthropic_body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "Hello"}
            ]
        }"#;

        let (translated, ctx) = translator
            .translate(anthropic_body.as_bytes(), &headers, None, "test-session")
            .unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(openai["model"], "claude-sonnet-4-20250514");
        assert_eq!(openai["messages"][0]["role"], "user");
        assert_eq!(openai["messages"][0]["content"], "Hello");
        assert_eq!(openai["max_tokens"], 1024);
        assert_eq!(
            ctx.original_model,
            Some("claude-sonnet-4-20250514".to_string())
        );
    }

    #[test]
    fn system_prompt_becomes_message() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let anthropic_body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "system": "You are helpful",
            "messages": [
                {"role": "user", "content": "Hello"}
            ]
        }"#;

        let (translated, _) = translator
            .translate(anthropic_body.as_bytes(), &headers, None, "test-session")
            .unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(openai["messages"][0]["role"], "system");
        assert_eq!(openai["messages"][0]["content"], "You are helpful");
        assert_eq!(openai["messages"][1]["role"], "user");
    }

    #[test]
    fn tool_use_conversion() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let anthropic_body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "What's the weather?"},
                {
                    "role": "assistant",
                    "content": [{
                        "type": "tool_use",
                        "id": "tool_123",
                        "name": "get_weather",
                        "input": {"city": "London"}
                    }]
                },
                {
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": "tool_123",
                        "content": "Sunny, 22°C"
                    }]
                }
            ]
        }"#;

        let (translated, _) = translator
            .translate(anthropic_body.as_bytes(), &headers, None, "test-session")
            .unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        let assistant_msg = &openai["messages"][1];
        assert_eq!(assistant_msg["role"], "assistant");
        let tool_calls = assistant_msg["tool_calls"].as_array().unwrap();
        assert_eq!(tool_calls[0]["id"], "tool_123");
        assert_eq!(tool_calls[0]["function"]["name"], "get_weather");

        let tool_msg = &openai["messages"][2];
        assert_eq!(tool_msg["role"], "tool");
        assert_eq!(tool_msg["tool_call_id"], "tool_123");
    }

    #[test]
    fn mcp_tool_name_is_sanitized() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let anthropic_body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "tools": [{"name": "mcp__github__create_issue", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let (translated, _) = translator
            .translate(anthropic_body.as_bytes(), &headers, None, "test-session")
            .unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        let name = openai["tools"][0]["function"]["name"].as_str().unwrap();
        assert!(name.starts_with("mcp_"));
        assert!(!name.contains("__"));
    }

    #[test]
    fn thinking_to_reasoning_passthrough() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let anthropic_body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 16000,
            "thinking": {"type": "enabled", "budget_tokens": 8000},
            "messages": [{"role": "user", "content": "Solve this"}]
        }"#;

        let (translated, _) = translator
            .translate(anthropic_body.as_bytes(), &headers, None, "test-session")
            .unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(openai["reasoning"]["max_tokens"], 8000);
    }

    #[test]
    fn tool_choice_conversion() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let anthropic_body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "tool_choice": {"type": "any"},
            "tools": [{"name": "test", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let (translated, _) = translator
            .translate(anthropic_body.as_bytes(), &headers, None, "test-session")
            .unwrap();
        let openai: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(openai["tool_choice"], "required");
    }
}
