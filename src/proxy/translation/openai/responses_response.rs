//! OpenAI Responses API -> Anthropic response translation, buffered and
//! streaming.
//!
//! The Responses API is a stateful event stream keyed around "output items"
//! rather than flat `choices[].delta`. Mapping:
//!
//! | Responses event                            | Anthropic                    |
//! |----------------------------------------------|-------------------------------|
//! | `response.reasoning_summary_part.added`       | open `thinking` block         |
//! | `response.reasoning_summary_text.delta`       | `thinking_delta`              |
//! | `response.reasoning_summary_part.done`        | close `thinking` block        |
//! | `*.output_text.delta`                         | `text` block / `text_delta`   |
//! | `response.output_item.added` (function_call)  | open `tool_use` block         |
//! | `response.function_call_arguments.delta`      | `input_json_delta`            |
//! | `response.refusal.delta` / `.done`            | prefixed text, then end_turn  |
//! | `response.completed`                          | `message_delta` + `message_stop`, stores `lastResponseId` |
//! | `error`                                       | `[upstream_error]` text, then terminate |
//!
//! Lifecycle events (`response.created`, `response.in_progress`,
//! `response.content_part.added/done`, `keepalive`) and any event type this
//! proxy doesn't recognize are silently dropped - the stream must never abort
//! on an unfamiliar event.

use super::format_sse_event;
use crate::proxy::translation::{
    context::{generate_message_id, OpenBlock, ToolCallState},
    Dialect, ResponseTranslator, TranslationContext,
};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

#[derive(Default)]
pub struct ResponsesToAnthropicResponse;

impl ResponsesToAnthropicResponse {
    pub fn new() -> Self {
        Self
    }
}

impl ResponseTranslator for ResponsesToAnthropicResponse {
    fn name(&self) -> &'static str {
        "responses-to-anthropic-response"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Responses
    }

    fn translate_buffered(&self, body: &[u8], ctx: &mut TranslationContext) -> Result<Vec<u8>> {
        let value: Value = serde_json::from_slice(body).context("Failed to parse Responses body")?;

        let mut content: Vec<AnthropicContentBlock> = Vec::new();
        let mut saw_tool_call = false;

        for item in value
            .get("output")
            .and_then(|o| o.as_array())
            .into_iter()
            .flatten()
        {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("reasoning") => {
                    let thinking = item
                        .get("summary")
                        .and_then(|s| s.as_array())
                        .into_iter()
                        .flatten()
                        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("");
                    if !thinking.is_empty() {
                        content.push(AnthropicContentBlock::Thinking { thinking });
                    }
                }
                Some("message") => {
                    let text = item
                        .get("content")
                        .and_then(|c| c.as_array())
                        .into_iter()
                        .flatten()
                        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("");
                    if !text.is_empty() {
                        content.push(AnthropicContentBlock::Text { text });
                    }
                }
                Some("function_call") => {
                    saw_tool_call = true;
                    let call_id = item
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let raw_name = item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    let arguments = item
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or("{}");
                    let input: Value = serde_json::from_str(arguments).unwrap_or(serde_json::json!({}));
                    content.push(AnthropicContentBlock::ToolUse {
                        id: call_id,
                        name: ctx.tool_name_map.resolve(raw_name),
                        input,
                    });
                }
                _ => {}
            }
        }

        let usage = value.get("usage");
        let anthropic_usage = AnthropicUsage {
            input_tokens: usage
                .and_then(|u| u.get("input_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            output_tokens: usage
                .and_then(|u| u.get("output_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        };

        let response = AnthropicResponse {
            id: generate_message_id(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: ctx.response_model_name(None),
            stop_reason: Some(if saw_tool_call { "tool_use" } else { "end_turn" }.to_string()),
            stop_sequence: None,
            usage: anthropic_usage,
        };

        serde_json::to_vec(&response).context("Failed to serialize Anthropic response")
    }

    fn translate_chunk(&self, chunk: &[u8], ctx: &mut TranslationContext) -> Result<Vec<u8>> {
        let chunk_str = std::str::from_utf8(chunk).context("Invalid UTF-8 in chunk")?;
        ctx.line_buffer.push_str(chunk_str);

        let mut output = Vec::new();

        while let Some(newline_pos) = ctx.line_buffer.find('\n') {
            let line = ctx.line_buffer[..newline_pos].trim().to_string();
            ctx.line_buffer = ctx.line_buffer[newline_pos + 1..].to_string();

            if line.is_empty() {
                continue;
            }

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            if data == "[DONE]" {
                output.extend(self.finalize(ctx)?);
                continue;
            }

            output.extend(self.translate_event(data, ctx)?);
        }

        Ok(output)
    }

    fn finalize(&self, ctx: &mut TranslationContext) -> Result<Vec<u8>> {
        if ctx.finished {
            return Ok(Vec::new());
        }
        let mut output = Vec::new();
        close_block(ctx, &mut output)?;

        // ctx.stop_reason is set directly by the response.completed handler
        // on a clean finish. Reaching here with it unset means the stream
        // ended early - including mid tool-call arguments - so the turn is
        // always reported as end_turn.
        let stop_reason = ctx.stop_reason.clone().unwrap_or_else(|| "end_turn".to_string());
        output.extend(format_sse_event(
            "message_delta",
            &MessageDeltaEvent {
                event_type: "message_delta".to_string(),
                delta: MessageDelta {
                    stop_reason: stop_reason.clone(),
                    stop_sequence: None,
                },
                usage: DeltaUsage {
                    output_tokens: ctx.output_tokens as u32,
                },
            },
        )?);
        output.extend(format_sse_event(
            "message_stop",
            &MessageStopEvent {
                event_type: "message_stop".to_string(),
            },
        )?);
        ctx.finished = true;
        Ok(output)
    }
}

impl ResponsesToAnthropicResponse {
    fn translate_event(&self, data: &str, ctx: &mut TranslationContext) -> Result<Vec<u8>> {
        let value: Value = serde_json::from_str(data).context("Failed to parse Responses SSE data")?;
        let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

        let mut output = Vec::new();

        if !ctx.sent_message_start {
            output.extend(format_sse_event(
                "message_start",
                &MessageStartEvent {
                    event_type: "message_start".to_string(),
                    message: MessageStartPayload {
                        id: generate_message_id(),
                        msg_type: "message".to_string(),
                        role: "assistant".to_string(),
                        content: vec![],
                        model: ctx.response_model_name(None),
                        stop_reason: None,
                        stop_sequence: None,
                        usage: AnthropicUsage {
                            input_tokens: 0,
                            output_tokens: 0,
                        },
                    },
                },
            )?);
            ctx.sent_message_start = true;
        }

        match event_type {
            "response.reasoning_summary_part.added" => {
                if ctx.open_block != Some(OpenBlock::Thinking) {
                    close_block(ctx, &mut output)?;
                    let index = ctx.open_new_block(OpenBlock::Thinking);
                    output.extend(format_sse_event(
                        "content_block_start",
                        &ContentBlockStartEvent {
                            event_type: "content_block_start".to_string(),
                            index,
                            content_block: ContentBlockPayload::Thinking {
                                thinking: String::new(),
                            },
                        },
                    )?);
                }
            }
            "response.reasoning_summary_text.delta" => {
                let delta = value.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                if !delta.is_empty() {
                    output.extend(format_sse_event(
                        "content_block_delta",
                        &ContentBlockDeltaEvent {
                            event_type: "content_block_delta".to_string(),
                            index: ctx.next_block_index.saturating_sub(1),
                            delta: ContentDelta::ThinkingDelta {
                                thinking: delta.to_string(),
                            },
                        },
                    )?);
                }
            }
            "response.reasoning_summary_part.done" => {
                close_block(ctx, &mut output)?;
            }
            t if t.ends_with("output_text.delta") => {
                let delta = value.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                if !delta.is_empty() {
                    if ctx.open_block != Some(OpenBlock::Text) {
                        close_block(ctx, &mut output)?;
                        let index = ctx.open_new_block(OpenBlock::Text);
                        output.extend(format_sse_event(
                            "content_block_start",
                            &ContentBlockStartEvent {
                                event_type: "content_block_start".to_string(),
                                index,
                                content_block: ContentBlockPayload::Text {
                                    text: String::new(),
                                },
                            },
                        )?);
                    }
                    output.extend(format_sse_event(
                        "content_block_delta",
                        &ContentBlockDeltaEvent {
                            event_type: "content_block_delta".to_string(),
                            index: ctx.next_block_index.saturating_sub(1),
                            delta: ContentDelta::TextDelta {
                                text: delta.to_string(),
                            },
                        },
                    )?);
                }
            }
            "response.output_item.added" => {
                if let Some(item) = value.get("item") {
                    if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
                        close_block(ctx, &mut output)?;
                        let item_id = value
                            .get("item_id")
                            .and_then(|v| v.as_str())
                            .or_else(|| item.get("id").and_then(|v| v.as_str()))
                            .unwrap_or_default()
                            .to_string();
                        let call_id = item
                            .get("call_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or(&item_id)
                            .to_string();
                        let raw_name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                        let original_name = ctx.tool_name_map.resolve(raw_name);

                        let block_index = ctx.open_new_block(OpenBlock::ToolUse);
                        ctx.saw_tool_call = true;
                        let key = if item_id.is_empty() { call_id.clone() } else { item_id };
                        ctx.tool_calls.insert(
                            key,
                            ToolCallState {
                                id: call_id.clone(),
                                name: original_name.clone(),
                                block_index,
                                started: true,
                            },
                        );

                        output.extend(format_sse_event(
                            "content_block_start",
                            &ContentBlockStartEvent {
                                event_type: "content_block_start".to_string(),
                                index: block_index,
                                content_block: ContentBlockPayload::ToolUse {
                                    id: call_id,
                                    name: original_name,
                                    input: serde_json::json!({}),
                                },
                            },
                        )?);
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                let delta = value.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                if !delta.is_empty() {
                    let item_id = value.get("item_id").and_then(|v| v.as_str()).unwrap_or("");
                    let state = ctx
                        .tool_calls
                        .get(item_id)
                        .or_else(|| ctx.tool_calls.values().next());
                    if let Some(state) = state {
                        output.extend(format_sse_event(
                            "content_block_delta",
                            &ContentBlockDeltaEvent {
                                event_type: "content_block_delta".to_string(),
                                index: state.block_index,
                                delta: ContentDelta::InputJsonDelta {
                                    partial_json: delta.to_string(),
                                },
                            },
                        )?);
                    }
                }
            }
            "response.refusal.delta" => {
                let delta = value.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                let first = ctx.open_block != Some(OpenBlock::Text);
                if first {
                    close_block(ctx, &mut output)?;
                    let index = ctx.open_new_block(OpenBlock::Text);
                    output.extend(format_sse_event(
                        "content_block_start",
                        &ContentBlockStartEvent {
                            event_type: "content_block_start".to_string(),
                            index,
                            content_block: ContentBlockPayload::Text {
                                text: String::new(),
                            },
                        },
                    )?);
                }
                let text = if first {
                    format!("[refusal] {}", delta)
                } else {
                    delta.to_string()
                };
                output.extend(format_sse_event(
                    "content_block_delta",
                    &ContentBlockDeltaEvent {
                        event_type: "content_block_delta".to_string(),
                        index: ctx.next_block_index.saturating_sub(1),
                        delta: ContentDelta::TextDelta { text },
                    },
                )?);
            }
            "response.refusal.done" => {
                output.extend(self.finalize(ctx)?);
            }
            "response.completed" => {
                if let Some(response) = value.get("response") {
                    if let Some(id) = response.get("id").and_then(|v| v.as_str()) {
                        ctx.upstream_response_id = Some(id.to_string());
                    }
                    if let Some(usage) = response.get("usage") {
                        ctx.input_tokens = usage
                            .get("input_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(ctx.input_tokens);
                        ctx.output_tokens = usage
                            .get("output_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(ctx.output_tokens);
                    }
                }
                if ctx.stop_reason.is_none() {
                    let reason = if ctx.saw_tool_call { "tool_use" } else { "end_turn" };
                    ctx.stop_reason = Some(reason.to_string());
                }
                output.extend(self.finalize(ctx)?);
            }
            "error" => {
                let message = value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .or_else(|| {
                        value
                            .get("error")
                            .and_then(|e| e.get("message"))
                            .and_then(|v| v.as_str())
                    })
                    .unwrap_or("unknown upstream error");

                if ctx.open_block != Some(OpenBlock::Text) {
                    close_block(ctx, &mut output)?;
                    let index = ctx.open_new_block(OpenBlock::Text);
                    output.extend(format_sse_event(
                        "content_block_start",
                        &ContentBlockStartEvent {
                            event_type: "content_block_start".to_string(),
                            index,
                            content_block: ContentBlockPayload::Text {
                                text: String::new(),
                            },
                        },
                    )?);
                }
                output.extend(format_sse_event(
                    "content_block_delta",
                    &ContentBlockDeltaEvent {
                        event_type: "content_block_delta".to_string(),
                        index: ctx.next_block_index.saturating_sub(1),
                        delta: ContentDelta::TextDelta {
                            text: format!("[upstream_error] {}", message),
                        },
                    },
                )?);
                output.extend(self.finalize(ctx)?);
            }
            // Lifecycle events and anything unrecognized: dropped, never panic.
            _ => {}
        }

        Ok(output)
    }
}

fn block_index_for(ctx: &TranslationContext, kind: OpenBlock) -> u32 {
    if kind == OpenBlock::ToolUse {
        ctx.tool_calls
            .values()
            .map(|t| t.block_index)
            .max()
            .unwrap_or(0)
    } else {
        ctx.next_block_index.saturating_sub(1)
    }
}

fn close_block(ctx: &mut TranslationContext, output: &mut Vec<u8>) -> Result<()> {
    if let Some(kind) = ctx.open_block {
        let index = block_index_for(ctx, kind);
        output.extend(format_sse_event(
            "content_block_stop",
            &ContentBlockStopEvent {
                event_type: "content_block_stop".to_string(),
                index,
            },
        )?);
        ctx.close_open_block();
    }
    Ok(())
}

// ============================================================================
// Anthropic Response Types (Output - Serialize)
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicResponse {
    id: String,
    #[serde(rename = "type")]
    response_type: String,
    role: String,
    content: Vec<AnthropicContentBlock>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct MessageStartEvent {
    #[serde(rename = "type")]
    event_type: String,
    message: MessageStartPayload,
}

#[derive(Debug, Serialize)]
struct MessageStartPayload {
    id: String,
    #[serde(rename = "type")]
    msg_type: String,
    role: String,
    content: Vec<Value>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Serialize)]
struct ContentBlockStartEvent {
    #[serde(rename = "type")]
    event_type: String,
    index: u32,
    content_block: ContentBlockPayload,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentBlockPayload {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Serialize)]
struct ContentBlockDeltaEvent {
    #[serde(rename = "type")]
    event_type: String,
    index: u32,
    delta: ContentDelta,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Serialize)]
struct ContentBlockStopEvent {
    #[serde(rename = "type")]
    event_type: String,
    index: u32,
}

#[derive(Debug, Serialize)]
struct MessageDeltaEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: MessageDelta,
    usage: DeltaUsage,
}

#[derive(Debug, Serialize)]
struct MessageDelta {
    stop_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeltaUsage {
    output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct MessageStopEvent {
    #[serde(rename = "type")]
    event_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::translation::context::ModelMapping;
    use std::sync::Arc;

    fn make_ctx() -> TranslationContext {
        TranslationContext::new(Arc::new(ModelMapping::new()), true)
            .with_original_model("claude-sonnet-4-20250514".to_string())
    }

    #[test]
    fn buffered_response_includes_thinking_block() {
        let translator = ResponsesToAnthropicResponse::new();
        let mut ctx = make_ctx();

        let body = r#"{
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "let me think"}]},
                {"type": "message", "content": [{"type": "output_text", "text": "Hello!"}]}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;

        let translated = translator.translate_buffered(body.as_bytes(), &mut ctx).unwrap();
        let anthropic: Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(anthropic["content"][0]["type"], "thinking");
        assert_eq!(anthropic["content"][0]["thinking"], "let me think");
        assert_eq!(anthropic["content"][1]["type"], "text");
    }

    #[test]
    fn tool_call_round_trip() {
        let translator = ResponsesToAnthropicResponse::new();
        let mut ctx = make_ctx();
        ctx.tool_name_map.sanitize("mcp__github__create_issue_with_very_long_description_suffix_here");
        let short = ctx
            .tool_name_map
            .sanitize("mcp__github__create_issue_with_very_long_description_suffix_here");

        let ev1 = format!(
            "data: {{\"type\":\"response.output_item.added\",\"item_id\":\"item1\",\"item\":{{\"type\":\"function_call\",\"call_id\":\"c1\",\"name\":\"{}\"}}}}\n\n",
            short
        );
        let out1 = translator.translate_chunk(ev1.as_bytes(), &mut ctx).unwrap();
        let s1 = String::from_utf8(out1).unwrap();
        assert!(s1.contains("message_start"));
        assert!(s1.contains("tool_use"));
        assert!(s1.contains("mcp__github__create_issue_with_very_long_description_suffix_here"));

        let ev2 = b"data: {\"type\":\"response.function_call_arguments.delta\",\"item_id\":\"item1\",\"delta\":\"{\\\"ti\"}\n\n";
        let out2 = translator.translate_chunk(ev2, &mut ctx).unwrap();
        assert!(String::from_utf8(out2).unwrap().contains("input_json_delta"));

        let ev3 = b"data: {\"type\":\"response.completed\",\"response\":{\"id\":\"r1\",\"usage\":{\"input_tokens\":0,\"output_tokens\":4}}}\n\n";
        let out3 = translator.translate_chunk(ev3, &mut ctx).unwrap();
        let s3 = String::from_utf8(out3).unwrap();
        assert!(s3.contains("message_delta"));
        assert!(s3.contains("tool_use"));
        assert!(s3.contains("message_stop"));
        assert_eq!(ctx.upstream_response_id, Some("r1".to_string()));
    }

    #[test]
    fn reasoning_then_text() {
        let translator = ResponsesToAnthropicResponse::new();
        let mut ctx = make_ctx();

        let ev1 = b"data: {\"type\":\"response.reasoning_summary_part.added\"}\n\n";
        translator.translate_chunk(ev1, &mut ctx).unwrap();

        let ev2 = b"data: {\"type\":\"response.reasoning_summary_text.delta\",\"delta\":\"Thinking...\"}\n\n";
        let out2 = translator.translate_chunk(ev2, &mut ctx).unwrap();
        assert!(String::from_utf8(out2).unwrap().contains("thinking_delta"));

        let ev3 = b"data: {\"type\":\"response.reasoning_summary_part.done\"}\n\n";
        let out3 = translator.translate_chunk(ev3, &mut ctx).unwrap();
        assert!(String::from_utf8(out3).unwrap().contains("content_block_stop"));

        let ev4 = b"data: {\"type\":\"response.output_text.delta\",\"delta\":\"Answer\"}\n\n";
        let out4 = translator.translate_chunk(ev4, &mut ctx).unwrap();
        let s4 = String::from_utf8(out4).unwrap();
        assert!(s4.contains("content_block_start"));
        assert!(s4.contains("text_delta"));
    }

    #[test]
    fn unknown_event_is_dropped_without_panic() {
        let translator = ResponsesToAnthropicResponse::new();
        let mut ctx = make_ctx();
        let ev = b"data: {\"type\":\"response.some_future_event\",\"whatever\":true}\n\n";
        let out = translator.translate_chunk(ev, &mut ctx).unwrap();
        // message_start still fires since it's the first event seen.
        assert!(String::from_utf8(out).unwrap().contains("message_start"));
    }

    #[test]
    fn error_event_emits_bracketed_text_and_terminates() {
        let translator = ResponsesToAnthropicResponse::new();
        let mut ctx = make_ctx();
        let ev = b"data: {\"type\":\"error\",\"message\":\"boom\"}\n\n";
        let out = translator.translate_chunk(ev, &mut ctx).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("[upstream_error] boom"));
        assert!(s.contains("message_stop"));
        assert!(ctx.finished);
    }
}
