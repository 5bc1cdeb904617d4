//! Anthropic -> OpenAI Responses API request translation.
//!
//! Unlike Chat Completions, the Responses API is stateful: a chained request
//! (`previous_response_id` set) sends only the messages appended since the
//! last assistant turn, and omits `instructions`/`tools` entirely since the
//! upstream already has them from the first turn in the chain.
//!
//! | Anthropic                        | OpenAI Responses                   |
//! |------------------------------------|-------------------------------------|
//! | Top-level `system`                 | top-level `instructions`            |
//! | `tool_use` block                   | `function_call` input item          |
//! | `tool_result` block                | `function_call_output` input item   |
//! | `thinking.budget_tokens`           | `reasoning.effort`                  |

use crate::proxy::sanitize_names::ToolNameMap;
use crate::proxy::translation::{
    context::ModelMapping, Dialect, RequestTranslator, TranslationContext,
};
use anyhow::{Context, Result};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct AnthropicToResponsesRequest {
    model_mapping: Arc<ModelMapping>,
}

impl AnthropicToResponsesRequest {
    pub fn new(model_mapping: Arc<ModelMapping>) -> Self {
        Self { model_mapping }
    }
}

impl RequestTranslator for AnthropicToResponsesRequest {
    fn name(&self) -> &'static str {
        "anthropic-to-responses-request"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Responses
    }

    fn translate(
        &self,
        body: &[u8],
        _headers: &HeaderMap,
        chained: Option<&str>,
        session_id: &str,
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

        let system_text = anthropic_request.system.as_ref().map(|system| match system {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    SystemBlock::Text { text } => text.as_str(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        });

        let messages_to_translate: &[AnthropicMessage] = if chained.is_some() {
            let last_assistant = anthropic_request
                .messages
                .iter()
                .rposition(|m| m.role == "assistant");
            match last_assistant {
                Some(idx) => &anthropic_request.messages[idx + 1..],
                None => &anthropic_request.messages[..],
            }
        } else {
            &anthropic_request.messages[..]
        };

        let mut input: Vec<ResponsesInputItem> = Vec::new();
        for msg in messages_to_translate {
            input.extend(convert_message(msg, &mut tool_name_map));
        }

        let instructions = if chained.is_none() {
            system_text.filter(|t| !t.is_empty())
        } else {
            None
        };

        let tools = if chained.is_none() {
            anthropic_request.tools.map(|tools| {
                tools
                    .into_iter()
                    .map(|t| convert_tool(t, &mut tool_name_map))
                    .collect()
            })
        } else {
            None
        };

        let tool_choice = anthropic_request
            .tool_choice
            .map(|c| convert_tool_choice(c, &mut tool_name_map));

        let reasoning = anthropic_request
            .thinking
            .as_ref()
            .map(|t| ResponsesReasoningConfig {
                effort: derive_effort(t.budget_tokens),
                summary: "auto".to_string(),
            });

        let openai_model = self.model_mapping.to_upstream(&anthropic_request.model);

        let responses_request = ResponsesRequest {
            model: openai_model,
            input,
            instructions,
            previous_response_id: chained.map(|s| s.to_string()),
            max_output_tokens: anthropic_request.max_tokens,
            temperature: anthropic_request.temperature,
            top_p: anthropic_request.top_p,
            tools,
            tool_choice,
            reasoning,
            stream: true,
            prompt_cache_key: session_id.to_string(),
        };

        let translated_body = serde_json::to_vec(&responses_request)
            .context("Failed to serialize Responses request")?;

        let ctx = TranslationContext::new(
            self.model_mapping.clone(),
            anthropic_request.stream.unwrap_or(false),
        )
        .with_original_model(anthropic_request.model.clone())
        .with_tool_name_map(tool_name_map);

        tracing::debug!(
            "translated Anthropic request to Responses: model={} -> {}, chained={}",
            anthropic_request.model,
            responses_request.model,
            chained.is_some()
        );

        Ok((translated_body, ctx))
    }
}

fn derive_effort(budget_tokens: Option<u32>) -> String {
    match budget_tokens {
        Some(b) if b >= 10_000 => "high",
        Some(b) if b >= 2_000 => "medium",
        Some(_) => "low",
        None => "medium",
    }
    .to_string()
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
    stream: Option<bool>,
    #[serde(default)]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(default)]
    tool_choice: Option<AnthropicToolChoice>,
    #[serde(default)]
    thinking: Option<ThinkingConfig>,
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
    Image {
        #[allow(dead_code)]
        source: serde_json::Value,
    },
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
// OpenAI Responses Request Types (Output - Serialize)
// ============================================================================

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<ResponsesInputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ResponsesTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ResponsesToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ResponsesReasoningConfig>,
    stream: bool,
    prompt_cache_key: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ResponsesInputItem {
    #[serde(rename = "message")]
    Message {
        role: String,
        content: Vec<ResponsesContentPart>,
    },
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ResponsesContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}

#[derive(Debug, Serialize)]
struct ResponsesTool {
    #[serde(rename = "type")]
    tool_type: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ResponsesToolChoice {
    Mode(String),
    Specific {
        #[serde(rename = "type")]
        choice_type: String,
        name: String,
    },
}

#[derive(Debug, Serialize)]
struct ResponsesReasoningConfig {
    effort: String,
    summary: String,
}

// ============================================================================
// Conversion Functions
// ============================================================================

fn convert_message(msg: &AnthropicMessage, tool_name_map: &mut ToolNameMap) -> Vec<ResponsesInputItem> {
    match &msg.content {
        AnthropicContent::Text(text) => vec![ResponsesInputItem::Message {
            role: msg.role.clone(),
            content: vec![ResponsesContentPart::InputText { text: text.clone() }],
        }],
        AnthropicContent::Blocks(blocks) => {
            let mut items = Vec::new();
            let mut text_parts: Vec<String> = Vec::new();

            let flush_text = |text_parts: &mut Vec<String>, items: &mut Vec<ResponsesInputItem>| {
                if !text_parts.is_empty() {
                    items.push(ResponsesInputItem::Message {
                        role: msg.role.clone(),
                        content: vec![ResponsesContentPart::InputText {
                            text: text_parts.join(""),
                        }],
                    });
                    text_parts.clear();
                }
            };

            for block in blocks {
                match block {
                    AnthropicContentBlock::Text { text } => text_parts.push(text.clone()),
                    AnthropicContentBlock::Image { .. } | AnthropicContentBlock::Thinking { .. } => {}
                    AnthropicContentBlock::ToolUse { id, name, input } => {
                        flush_text(&mut text_parts, &mut items);
                        items.push(ResponsesInputItem::FunctionCall {
                            call_id: id.clone(),
                            name: tool_name_map.sanitize(name),
                            arguments: serde_json::to_string(input).unwrap_or_default(),
                        });
                    }
                    AnthropicContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => {
                        flush_text(&mut text_parts, &mut items);
                        let output = content
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
                        items.push(ResponsesInputItem::FunctionCallOutput {
                            call_id: tool_use_id.clone(),
                            output,
                        });
                    }
                }
            }
            flush_text(&mut text_parts, &mut items);

            items
        }
    }
}

fn convert_tool(tool: AnthropicTool, tool_name_map: &mut ToolNameMap) -> ResponsesTool {
    ResponsesTool {
        tool_type: "function".to_string(),
        name: tool_name_map.sanitize(&tool.name),
        description: tool.description,
        parameters: Some(tool.input_schema),
    }
}

fn convert_tool_choice(
    choice: AnthropicToolChoice,
    tool_name_map: &mut ToolNameMap,
) -> ResponsesToolChoice {
    match choice {
        AnthropicToolChoice::Auto => ResponsesToolChoice::Mode("auto".to_string()),
        AnthropicToolChoice::Any => ResponsesToolChoice::Mode("required".to_string()),
        AnthropicToolChoice::None => ResponsesToolChoice::Mode("none".to_string()),
        AnthropicToolChoice::Tool { name } => ResponsesToolChoice::Specific {
            choice_type: "function".to_string(),
            name: tool_name_map.sanitize(&name),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_translator() -> AnthropicToResponsesRequest {
        AnthropicToResponsesRequest::new(Arc::new(ModelMapping::new()))
    }

    #[test]
    fn simple_request_becomes_message_item() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "Hello"}]
        }"#;

        let (translated, ctx) = translator.translate(body.as_bytes(), &headers, None, "test-session").unwrap();
        let responses: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(responses["input"][0]["type"], "message");
        assert_eq!(responses["input"][0]["role"], "user");
        assert_eq!(responses["input"][0]["content"][0]["text"], "Hello");
        assert!(responses.get("previous_response_id").is_none());
        assert_eq!(ctx.original_model, Some("claude-sonnet-4-20250514".to_string()));
    }

    #[test]
    fn system_becomes_instructions() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "system": "You are helpful",
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let (translated, _) = translator.translate(body.as_bytes(), &headers, None, "test-session").unwrap();
        let responses: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(responses["instructions"], "You are helpful");
    }

    #[test]
    fn chained_request_omits_instructions_and_tools() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "system": "You are helpful",
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}],
            "messages": [
                {"role": "user", "content": "Hi"},
                {"role": "assistant", "content": "Hello!"},
                {"role": "user", "content": "And now?"}
            ]
        }"#;

        let (translated, _) = translator
            .translate(body.as_bytes(), &headers, Some("resp_123"), "test-session")
            .unwrap();
        let responses: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert!(responses.get("instructions").is_none());
        assert!(responses.get("tools").is_none());
        assert_eq!(responses["previous_response_id"], "resp_123");
        // Only the message after the last assistant turn is included.
        assert_eq!(responses["input"].as_array().unwrap().len(), 1);
        assert_eq!(responses["input"][0]["content"][0]["text"], "And now?");
    }

    #[test]
    fn tool_use_becomes_function_call() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "What's the weather?"},
                {
                    "role": "assistant",
                    "content": [{"type": "tool_use", "id": "call_1", "name": "get_weather", "input": {"city": "Paris"}}]
                },
                {
                    "role": "user",
                    "content": [{"type": "tool_result", "tool_use_id": "call_1", "content": "Sunny"}]
                }
            ]
        }"#;

        let (translated, _) = translator.translate(body.as_bytes(), &headers, None, "test-session").unwrap();
        let responses: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        let input = responses["input"].as_array().unwrap();
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "call_1");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["output"], "Sunny");
    }

    #[test]
    fn thinking_budget_maps_to_effort() {
        let translator = make_translator();
        let headers = HeaderMap::new();

        let body = r#"{
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 16000,
            "thinking": {"type": "enabled", "budget_tokens": 12000},
            "messages": [{"role": "user", "content": "Solve this"}]
        }"#;

        let (translated, _) = translator.translate(body.as_bytes(), &headers, None, "test-session").unwrap();
        let responses: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(responses["reasoning"]["effort"], "high");
        assert_eq!(responses["reasoning"]["summary"], "auto");
    }
}
