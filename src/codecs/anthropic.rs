//! Anthropic-style messages codec.
//!
//! Departures from the OpenAI shape: the system prompt is a top-level
//! field, `max_tokens` is mandatory, tool results ride inside `user`
//! turns, and thinking blocks carry an opaque signature that must be
//! returned verbatim on the next turn.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;

use crate::canonical::{
    BlockKind, CanonicalRequest, CanonicalResponse, ContentBlock, FinishReason, Message,
    ResponseFormat, Role, Usage,
};
use crate::codecs::{mentions_json, push_sampling, Codec, WireRequest, JSON_MODE_INSTRUCTION};
use crate::error::CodecError;
use crate::models::{capabilities_for, compute_limit, SamplingParam};
use crate::streaming::{SseFrame, StreamSignal};

pub const MESSAGES_PATH: &str = "/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const STREAM_EVENTS: &[&str] = &[
    "message_start",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "message_delta",
    "message_stop",
    "ping",
    "error",
];

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessagePart {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        signature: Option<String>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    id: String,
    model: String,
    #[serde(default)]
    content: Vec<MessagePart>,
    stop_reason: Option<String>,
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize, Debug, Default)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn finish_reason_from_wire(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::Refusal,
        _ => FinishReason::Stop,
    }
}

fn encode_part(block: &ContentBlock) -> MessagePart {
    match block {
        ContentBlock::Text { text } => MessagePart::Text { text: text.clone() },
        ContentBlock::Image { media_type, data } => MessagePart::Image {
            source: ImageSource {
                source_type: "base64".to_string(),
                media_type: media_type.clone(),
                data: data.clone(),
            },
        },
        ContentBlock::ToolUse { id, name, input } => MessagePart::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult {
            tool_call_id,
            content,
            is_error,
        } => MessagePart::ToolResult {
            tool_use_id: tool_call_id.clone(),
            content: content.clone(),
            is_error: *is_error,
        },
        ContentBlock::Thinking { text, signature } => MessagePart::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        },
    }
}

fn decode_part(part: &MessagePart) -> ContentBlock {
    match part {
        MessagePart::Text { text } => ContentBlock::Text { text: text.clone() },
        MessagePart::Image { source } => ContentBlock::Image {
            media_type: source.media_type.clone(),
            data: source.data.clone(),
        },
        MessagePart::ToolUse { id, name, input } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        MessagePart::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_call_id: tool_use_id.clone(),
            content: content.clone(),
            is_error: *is_error,
        },
        MessagePart::Thinking {
            thinking,
            signature,
        } => ContentBlock::Thinking {
            text: thinking.clone(),
            signature: signature.clone(),
        },
    }
}

fn encode_message(message: &Message, appended_instruction: Option<&str>) -> Value {
    // Tool turns and system turns have no wire role of their own; both
    // ride as user content (a tool_result part keeps the linkage).
    let role = match message.role {
        Role::Assistant => "assistant",
        _ => "user",
    };
    let mut parts: Vec<MessagePart> = message.content.iter().map(encode_part).collect();
    if let Some(instruction) = appended_instruction {
        parts.push(MessagePart::Text {
            text: instruction.to_string(),
        });
    }
    json!({"role": role, "content": parts})
}

pub struct AnthropicCodec;

impl Codec for AnthropicCodec {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn encode_request(
        &self,
        request: &CanonicalRequest,
        mut wire: WireRequest,
    ) -> Result<WireRequest, CodecError> {
        let caps = capabilities_for(&request.model);

        let mut system = request.system.clone();
        // No native response-format field; json mode becomes instructions.
        match &request.response_format {
            None | Some(ResponseFormat::Text) => {}
            Some(ResponseFormat::JsonObject) => {
                if !mentions_json(request) {
                    let appended = match system.take() {
                        Some(s) => format!("{}\n{}", s, JSON_MODE_INSTRUCTION),
                        None => JSON_MODE_INSTRUCTION.to_string(),
                    };
                    system = Some(appended);
                }
            }
            Some(ResponseFormat::JsonSchema { schema, .. }) => {
                let instruction = format!(
                    "{} It must conform to this JSON schema: {}",
                    JSON_MODE_INSTRUCTION, schema
                );
                let appended = match system.take() {
                    Some(s) => format!("{}\n{}", s, instruction),
                    None => instruction,
                };
                system = Some(appended);
            }
        }

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| encode_message(m, None))
            .collect();

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), Value::from(request.model.clone()));
        body.insert("messages".to_string(), Value::Array(messages));
        if let Some(system) = system {
            body.insert("system".to_string(), Value::from(system));
        }
        if let Some(tools) = &request.tools {
            let encoded: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect();
            body.insert("tools".to_string(), Value::Array(encoded));
        }

        // Required by the protocol, so the computed limit always goes out.
        let limit = compute_limit(
            caps,
            request.max_tokens,
            request.tool_count(),
            request.messages.len(),
        );
        body.insert("max_tokens".to_string(), Value::from(limit));

        push_sampling(
            &mut body,
            caps,
            SamplingParam::Temperature,
            "temperature",
            request.temperature,
        );
        push_sampling(&mut body, caps, SamplingParam::TopP, "top_p", request.top_p);
        push_sampling(
            &mut body,
            caps,
            SamplingParam::FrequencyPenalty,
            "frequency_penalty",
            request.frequency_penalty,
        );
        push_sampling(
            &mut body,
            caps,
            SamplingParam::PresencePenalty,
            "presence_penalty",
            request.presence_penalty,
        );

        if request.stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }

        wire.path = MESSAGES_PATH.to_string();
        wire.body = Value::Object(body);
        Ok(wire)
    }

    fn decode_response(
        &self,
        body: &Value,
        _decoded: Option<CanonicalResponse>,
    ) -> Result<Option<CanonicalResponse>, CodecError> {
        let response: MessagesResponse = serde_json::from_value(body.clone())?;
        let content: Vec<ContentBlock> = response.content.iter().map(decode_part).collect();
        let finish_reason = response
            .stop_reason
            .as_deref()
            .map(finish_reason_from_wire)
            .unwrap_or(FinishReason::Stop);
        let usage = response.usage.unwrap_or_default();
        Ok(Some(CanonicalResponse {
            id: response.id,
            model: response.model,
            content,
            finish_reason,
            usage: Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                reasoning_tokens: None,
            },
            reasoning_summary: None,
        }))
    }

    fn decode_stream_frame(
        &self,
        frame: &SseFrame,
    ) -> Result<Option<Vec<StreamSignal>>, CodecError> {
        let Some(event) = frame.event.as_deref() else {
            return Ok(None);
        };
        if !STREAM_EVENTS.contains(&event) {
            return Ok(None);
        }
        if event == "ping" {
            return Ok(Some(vec![StreamSignal::Ignore]));
        }
        let data = frame
            .data_json()
            .ok_or_else(|| CodecError::MissingField("data".to_string()))?;
        let index = data["index"].as_u64().unwrap_or(0) as u32;

        let signals = match event {
            "message_start" => {
                let message = &data["message"];
                let mut signals = vec![StreamSignal::MessageStart {
                    id: message["id"].as_str().unwrap_or_default().to_string(),
                    model: message["model"].as_str().unwrap_or_default().to_string(),
                }];
                if let Some(input_tokens) = message["usage"]["input_tokens"].as_u64() {
                    signals.push(StreamSignal::UsageReported {
                        usage: Usage {
                            input_tokens: input_tokens as u32,
                            output_tokens: 0,
                            reasoning_tokens: None,
                        },
                    });
                }
                signals
            }
            "content_block_start" => {
                let block = &data["content_block"];
                let kind = match block["type"].as_str() {
                    Some("tool_use") => BlockKind::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                    },
                    Some("thinking") => BlockKind::Thinking,
                    _ => BlockKind::Text,
                };
                vec![StreamSignal::BlockAdded { key: index, kind }]
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => vec![StreamSignal::TextDelta {
                        key: index,
                        text: delta["text"].as_str().unwrap_or_default().to_string(),
                    }],
                    Some("thinking_delta") => vec![StreamSignal::ThinkingDelta {
                        key: index,
                        text: delta["thinking"].as_str().unwrap_or_default().to_string(),
                    }],
                    Some("signature_delta") => vec![StreamSignal::SignatureDelta {
                        key: index,
                        signature: delta["signature"].as_str().unwrap_or_default().to_string(),
                    }],
                    Some("input_json_delta") => vec![StreamSignal::ArgumentsDelta {
                        key: index,
                        partial_json: delta["partial_json"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    }],
                    other => {
                        log::debug!("unknown content delta type {:?}, skipped", other);
                        vec![StreamSignal::Ignore]
                    }
                }
            }
            "content_block_stop" => vec![StreamSignal::BlockDone { key: index }],
            "message_delta" => {
                let mut signals = Vec::new();
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    signals.push(StreamSignal::FinishReported {
                        reason: finish_reason_from_wire(reason),
                    });
                }
                if let Some(output_tokens) = data["usage"]["output_tokens"].as_u64() {
                    signals.push(StreamSignal::UsageReported {
                        usage: Usage {
                            input_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0)
                                as u32,
                            output_tokens: output_tokens as u32,
                            reasoning_tokens: None,
                        },
                    });
                }
                signals
            }
            "message_stop" => vec![StreamSignal::Completed {
                reported: None,
                usage: None,
            }],
            "error" => vec![StreamSignal::Completed {
                reported: Some(FinishReason::Error),
                usage: None,
            }],
            _ => vec![StreamSignal::Ignore],
        };
        Ok(Some(signals))
    }

    fn authenticate(&self, wire: WireRequest, api_key: &str) -> WireRequest {
        wire.header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}
