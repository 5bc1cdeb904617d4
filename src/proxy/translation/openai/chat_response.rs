//! OpenAI Chat Completions -> Anthropic response translation, buffered and
//! streaming.
//!
//! | OpenAI Chat Completions           | Anthropic                          |
//! |------------------------------------|-------------------------------------|
//! | first chunk                        | `message_start`                     |
//! | `delta.reasoning_content`          | `thinking` block                    |
//! | `delta.content`                    | `text` block                        |
//! | `delta.tool_calls[].id+name`       | `content_block_start` (tool_use)     |
//! | `delta.tool_calls[].arguments`     | `input_json_delta`                  |
//! | `finish_reason`                    | `message_delta` + `stop_reason`      |
//! | `data: [DONE]`                     | `message_stop`                      |

use super::{convert_finish_reason, format_sse_event};
use crate::proxy::translation::{
    context::{generate_message_id, OpenBlock, ToolCallState},
    Dialect, ResponseTranslator, TranslationContext,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Default)]
pub struct ChatToAnthropicResponse;

impl ChatToAnthropicResponse {
    pub fn new() -> Self {
        Self
    }
}

impl ResponseTranslator for ChatToAnthropicResponse {
    fn name(&self) -> &'static str {
        "chat-completions-to-anthropic-response"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Chat
    }

    fn translate_buffered(&self, body: &[u8], ctx: &mut TranslationContext) -> Result<Vec<u8>> {
        let openai_response: OpenAiChatCompletion =
            serde_json::from_slice(body).context("Failed to parse OpenAI response")?;

        let choice = openai_response.choices.first();
        let mut content: Vec<AnthropicContentBlock> = Vec::new();

        if let Some(choice) = choice {
            if let Some(thinking) = &choice.message.reasoning_content {
                if !thinking.is_empty() {
                    content.push(AnthropicContentBlock::Thinking { thinking: thinking.clone() });
                }
            }
            if let Some(text) = &choice.message.content {
                if !text.is_empty() {
                    content.push(AnthropicContentBlock::Text { text: text.clone() });
                }
            }
            if let Some(tool_calls) = &choice.message.tool_calls {
                for tc in tool_calls {
                    let input: serde_json::Value =
                        serde_json::from_str(&tc.function.arguments).unwrap_or(serde_json::json!({}));
                    content.push(AnthropicContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: ctx.tool_name_map.resolve(&tc.function.name),
                        input,
                    });
                }
            }
        }

        let stop_reason = choice
            .and_then(|c| c.finish_reason.as_ref())
            .map(|r| convert_finish_reason(r));

        let usage = openai_response
            .usage
            .as_ref()
            .map(|u| AnthropicUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or(AnthropicUsage {
                input_tokens: 0,
                output_tokens: 0,
            });

        let response = AnthropicResponse {
            id: generate_message_id(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: ctx.response_model_name(Some(&openai_response.model)),
            stop_reason,
            stop_sequence: None,
            usage,
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

            output.extend(self.translate_sse_data(data, ctx)?);
        }

        Ok(output)
    }

    fn finalize(&self, ctx: &mut TranslationContext) -> Result<Vec<u8>> {
        if ctx.finished {
            return Ok(Vec::new());
        }
        let mut output = Vec::new();

        if ctx.stop_reason.is_none() {
            if let Some(kind) = ctx.open_block {
                output.extend(format_sse_event(
                    "content_block_stop",
                    &ContentBlockStopEvent {
                        event_type: "content_block_stop".to_string(),
                        index: block_index_for(ctx, kind),
                    },
                )?);
                ctx.close_open_block();
            }
            // Reaching finalize with no stop_reason set means the stream
            // ended without an explicit finish_reason - including mid
            // tool-call arguments - so the terminal turn is always reported
            // as end_turn here; "tool_use" only ever comes from an explicit
            // finish_reason.
            let stop_reason = "end_turn";
            ctx.stop_reason = Some(stop_reason.to_string());
            output.extend(format_sse_event(
                "message_delta",
                &MessageDeltaEvent {
                    event_type: "message_delta".to_string(),
                    delta: MessageDelta {
                        stop_reason: stop_reason.to_string(),
                        stop_sequence: None,
                    },
                    usage: DeltaUsage {
                        output_tokens: ctx.output_tokens as u32,
                    },
                },
            )?);
        }

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

/// The block index that was last open for `kind`, falling back to the
/// highest assigned index. Used only when closing a block at finalize time.
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

impl ChatToAnthropicResponse {
    fn translate_sse_data(&self, data: &str, ctx: &mut TranslationContext) -> Result<Vec<u8>> {
        let chunk: OpenAiStreamChunk =
            serde_json::from_str(data).context("Failed to parse OpenAI SSE data")?;

        let mut output = Vec::new();

        if !ctx.sent_message_start {
            let message_start = MessageStartEvent {
                event_type: "message_start".to_string(),
                message: MessageStartPayload {
                    id: generate_message_id(),
                    msg_type: "message".to_string(),
                    role: "assistant".to_string(),
                    content: vec![],
                    model: ctx.response_model_name(Some(&chunk.model)),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: AnthropicUsage {
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                },
            };
            output.extend(format_sse_event("message_start", &message_start)?);
            ctx.sent_message_start = true;
        }

        if let Some(usage) = &chunk.usage {
            ctx.input_tokens = usage.prompt_tokens as u64;
            ctx.output_tokens = usage.completion_tokens as u64;
        }

        for choice in &chunk.choices {
            if let Some(reasoning) = &choice.delta.reasoning_content {
                if !reasoning.is_empty() {
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
                    output.extend(format_sse_event(
                        "content_block_delta",
                        &ContentBlockDeltaEvent {
                            event_type: "content_block_delta".to_string(),
                            index: ctx.next_block_index.saturating_sub(1),
                            delta: ContentDelta::ThinkingDelta {
                                thinking: reasoning.clone(),
                            },
                        },
                    )?);
                }
            }

            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
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
                    ctx.accumulated_content.push_str(content);
                    output.extend(format_sse_event(
                        "content_block_delta",
                        &ContentBlockDeltaEvent {
                            event_type: "content_block_delta".to_string(),
                            index: ctx.next_block_index.saturating_sub(1),
                            delta: ContentDelta::TextDelta {
                                text: content.clone(),
                            },
                        },
                    )?);
                }
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for tc in tool_calls {
                    let key = tc.index.to_string();

                    if !ctx.tool_calls.contains_key(&key) {
                        let raw_name = tc
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default();
                        if tc.id.is_some() || !raw_name.is_empty() {
                            close_block(ctx, &mut output)?;
                            let block_index = ctx.open_new_block(OpenBlock::ToolUse);
                            let original_name = ctx.tool_name_map.resolve(&raw_name);
                            let id = tc.id.clone().unwrap_or_default();
                            ctx.saw_tool_call = true;
                            ctx.tool_calls.insert(
                                key.clone(),
                                ToolCallState {
                                    id: id.clone(),
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
                                        id,
                                        name: original_name,
                                        input: serde_json::json!({}),
                                    },
                                },
                            )?);
                        }
                    }

                    if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.as_ref()) {
                        if !args.is_empty() {
                            if let Some(state) = ctx.tool_calls.get(&key) {
                                output.extend(format_sse_event(
                                    "content_block_delta",
                                    &ContentBlockDeltaEvent {
                                        event_type: "content_block_delta".to_string(),
                                        index: state.block_index,
                                        delta: ContentDelta::InputJsonDelta {
                                            partial_json: args.clone(),
                                        },
                                    },
                                )?);
                            }
                        }
                    }
                }
            }

            if let Some(finish_reason) = &choice.finish_reason {
                close_block(ctx, &mut output)?;

                let stop_reason = convert_finish_reason(finish_reason);
                ctx.stop_reason = Some(stop_reason.clone());

                output.extend(format_sse_event(
                    "message_delta",
                    &MessageDeltaEvent {
                        event_type: "message_delta".to_string(),
                        delta: MessageDelta {
                            stop_reason,
                            stop_sequence: None,
                        },
                        usage: DeltaUsage {
                            output_tokens: ctx.output_tokens as u32,
                        },
                    },
                )?);
            }
        }

        Ok(output)
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
// OpenAI Response Types (Input - Deserialize)
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiChatCompletion {
    #[allow(dead_code)]
    id: String,
    #[serde(default)]
    #[allow(dead_code)]
    object: Option<String>,
    #[allow(dead_code)]
    created: u64,
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[allow(dead_code)]
    index: u32,
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[allow(dead_code)]
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    call_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[allow(dead_code)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[allow(dead_code)]
    id: String,
    #[serde(default)]
    #[allow(dead_code)]
    object: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    created: Option<u64>,
    model: String,
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[allow(dead_code)]
    index: u32,
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    #[allow(dead_code)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    #[serde(default)]
    #[allow(dead_code)]
    call_type: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
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
        input: serde_json::Value,
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
    content: Vec<serde_json::Value>,
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
        input: serde_json::Value,
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

    fn make_ctx(streaming: bool) -> TranslationContext {
        TranslationContext::new(Arc::new(ModelMapping::new()), streaming)
            .with_original_model("claude-sonnet-4-20250514".to_string())
    }

    #[test]
    fn buffered_response_translation() {
        let translator = ChatToAnthropicResponse::new();
        let mut ctx = make_ctx(false);

        let openai_body = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1234567890,
            "model": "gpt-4-turbo",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;

        let translated = translator
            .translate_buffered(openai_body.as_bytes(), &mut ctx)
            .unwrap();
        let anthropic: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(anthropic["type"], "message");
        assert_eq!(anthropic["model"], "claude-sonnet-4-20250514");
        assert_eq!(anthropic["content"][0]["type"], "text");
        assert_eq!(anthropic["stop_reason"], "end_turn");
        assert_eq!(anthropic["usage"]["input_tokens"], 10);
    }

    #[test]
    fn buffered_response_includes_thinking_block() {
        let translator = ChatToAnthropicResponse::new();
        let mut ctx = make_ctx(false);

        let openai_body = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1234567890,
            "model": "gpt-4-turbo",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "reasoning_content": "let me think", "content": "Hello!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;

        let translated = translator
            .translate_buffered(openai_body.as_bytes(), &mut ctx)
            .unwrap();
        let anthropic: serde_json::Value = serde_json::from_slice(&translated).unwrap();

        assert_eq!(anthropic["content"][0]["type"], "thinking");
        assert_eq!(anthropic["content"][0]["thinking"], "let me think");
        assert_eq!(anthropic["content"][1]["type"], "text");
    }

    #[test]
    fn streaming_text_then_done() {
        let translator = ChatToAnthropicResponse::new();
        let mut ctx = make_ctx(true);

        let chunk1 = b"data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4\",\"created\":1,\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n";
        let out1 = translator.translate_chunk(chunk1, &mut ctx).unwrap();
        assert!(String::from_utf8(out1).unwrap().contains("message_start"));

        let chunk2 = b"data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4\",\"created\":1,\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n";
        let out2 = translator.translate_chunk(chunk2, &mut ctx).unwrap();
        let s2 = String::from_utf8(out2).unwrap();
        assert!(s2.contains("text_delta"));
        assert!(s2.contains("content_block_start"));

        let chunk3 = b"data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4\",\"created\":1,\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n";
        let out3 = translator.translate_chunk(chunk3, &mut ctx).unwrap();
        assert!(String::from_utf8(out3).unwrap().contains("message_delta"));

        let chunk4 = b"data: [DONE]\n\n";
        let out4 = translator.translate_chunk(chunk4, &mut ctx).unwrap();
        assert!(String::from_utf8(out4).unwrap().contains("message_stop"));
    }

    #[test]
    fn streaming_tool_call_round_trip() {
        let translator = ChatToAnthropicResponse::new();
        let mut ctx = make_ctx(true);
        ctx.tool_name_map.sanitize("mcp__github__create_issue");
        let short = ctx.tool_name_map.sanitize("mcp__github__create_issue");

        let chunk1 = format!(
            "data: {{\"id\":\"chatcmpl-1\",\"model\":\"gpt-4\",\"created\":1,\"choices\":[{{\"index\":0,\"delta\":{{\"tool_calls\":[{{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{{\"name\":\"{}\",\"arguments\":\"\"}}}}]}},\"finish_reason\":null}}]}}\n\n",
            short
        );
        let out1 = translator.translate_chunk(chunk1.as_bytes(), &mut ctx).unwrap();
        let s1 = String::from_utf8(out1).unwrap();
        assert!(s1.contains("tool_use"));
        assert!(s1.contains("mcp__github__create_issue"));
        assert!(ctx.saw_tool_call);

        let chunk2 = b"data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4\",\"created\":1,\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"a\\\":1}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n";
        let out2 = translator.translate_chunk(chunk2, &mut ctx).unwrap();
        let s2 = String::from_utf8(out2).unwrap();
        assert!(s2.contains("input_json_delta"));
        assert!(s2.contains("tool_use"));
    }

    #[test]
    fn finalize_is_idempotent() {
        let translator = ChatToAnthropicResponse::new();
        let mut ctx = make_ctx(true);
        let first = translator.finalize(&mut ctx).unwrap();
        assert!(!first.is_empty());
        let second = translator.finalize(&mut ctx).unwrap();
        assert!(second.is_empty());
    }
}
