//! Gemini-style content codec.
//!
//! The wire format is camelCase throughout, the assistant role is named
//! `model`, and tool calls carry no ids; the function name stands in as
//! the canonical tool-call id, and a `functionResponse` is matched back
//! by that name.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use serde_with::skip_serializing_none;

use crate::canonical::{
    BlockKind, CanonicalRequest, CanonicalResponse, ContentBlock, FinishReason, Message, Role,
    ResponseFormat, Usage,
};
use crate::codecs::{push_sampling, Codec, WireRequest};
use crate::error::CodecError;
use crate::models::{capabilities_for, compute_limit, SamplingParam};
use crate::streaming::{SseFrame, StreamSignal};

// Stream block keys: one text channel, one thought channel, and
// per-frame slots for function calls (they arrive whole, never split).
const TEXT_KEY: u32 = 0;
const THOUGHT_KEY: u32 = 1;
const TOOL_KEY_BASE: u32 = 16;

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    /// Set on text parts that belong to the model's hidden deliberation.
    thought: Option<bool>,
    inline_data: Option<InlineData>,
    function_call: Option<FunctionCall>,
    function_response: Option<FunctionResponse>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
    response_id: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    thoughts_token_count: Option<u32>,
}

fn finish_reason_from_wire(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::Refusal,
        _ => FinishReason::Stop,
    }
}

fn text_part(text: impl Into<String>) -> Part {
    Part {
        text: Some(text.into()),
        ..Part::default()
    }
}

fn encode_part(block: &ContentBlock) -> Part {
    match block {
        ContentBlock::Text { text } => text_part(text.clone()),
        ContentBlock::Image { media_type, data } => Part {
            inline_data: Some(InlineData {
                mime_type: media_type.clone(),
                data: data.clone(),
            }),
            ..Part::default()
        },
        ContentBlock::ToolUse { name, input, .. } => Part {
            function_call: Some(FunctionCall {
                name: name.clone(),
                args: input.clone(),
            }),
            ..Part::default()
        },
        ContentBlock::ToolResult {
            tool_call_id,
            content,
            ..
        } => Part {
            function_response: Some(FunctionResponse {
                // The id was the function name all along; see decode.
                name: tool_call_id.clone(),
                response: json!({"result": content}),
            }),
            ..Part::default()
        },
        ContentBlock::Thinking { text, .. } => Part {
            text: Some(text.clone()),
            thought: Some(true),
            ..Part::default()
        },
    }
}

fn decode_part(part: &Part) -> Option<ContentBlock> {
    if let Some(call) = &part.function_call {
        return Some(ContentBlock::ToolUse {
            id: call.name.clone(),
            name: call.name.clone(),
            input: call.args.clone(),
        });
    }
    if let Some(text) = &part.text {
        if part.thought == Some(true) {
            return Some(ContentBlock::Thinking {
                text: text.clone(),
                signature: None,
            });
        }
        return Some(ContentBlock::Text { text: text.clone() });
    }
    None
}

fn encode_contents(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let parts: Vec<Part> = message.content.iter().map(encode_part).collect();
            json!({"role": role, "parts": parts})
        })
        .collect()
}

pub struct GeminiCodec;

impl GeminiCodec {
    fn generation_config(&self, request: &CanonicalRequest) -> Map<String, Value> {
        let caps = capabilities_for(&request.model);
        let mut config = Map::new();
        let limit = compute_limit(
            caps,
            request.max_tokens,
            request.tool_count(),
            request.messages.len(),
        );
        config.insert("maxOutputTokens".to_string(), Value::from(limit));
        push_sampling(
            &mut config,
            caps,
            SamplingParam::Temperature,
            "temperature",
            request.temperature,
        );
        push_sampling(&mut config, caps, SamplingParam::TopP, "topP", request.top_p);
        push_sampling(
            &mut config,
            caps,
            SamplingParam::FrequencyPenalty,
            "frequencyPenalty",
            request.frequency_penalty,
        );
        push_sampling(
            &mut config,
            caps,
            SamplingParam::PresencePenalty,
            "presencePenalty",
            request.presence_penalty,
        );
        match &request.response_format {
            None | Some(ResponseFormat::Text) => {}
            Some(ResponseFormat::JsonObject) => {
                config.insert(
                    "responseMimeType".to_string(),
                    Value::from("application/json"),
                );
            }
            Some(ResponseFormat::JsonSchema { schema, .. }) => {
                config.insert(
                    "responseMimeType".to_string(),
                    Value::from("application/json"),
                );
                config.insert("responseSchema".to_string(), schema.clone());
            }
        }
        config
    }
}

impl Codec for GeminiCodec {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn encode_request(
        &self,
        request: &CanonicalRequest,
        mut wire: WireRequest,
    ) -> Result<WireRequest, CodecError> {
        let mut body = Map::new();
        body.insert(
            "contents".to_string(),
            Value::Array(encode_contents(&request.messages)),
        );
        if let Some(system) = &request.system {
            body.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": system}]}),
            );
        }
        if let Some(tools) = &request.tools {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect();
            body.insert(
                "tools".to_string(),
                json!([{"functionDeclarations": declarations}]),
            );
        }
        body.insert(
            "generationConfig".to_string(),
            Value::Object(self.generation_config(request)),
        );

        let method = if request.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        wire.path = format!("/v1beta/models/{}:{}", request.model, method);
        wire.body = Value::Object(body);
        Ok(wire)
    }

    fn decode_response(
        &self,
        body: &Value,
        _decoded: Option<CanonicalResponse>,
    ) -> Result<Option<CanonicalResponse>, CodecError> {
        let response: GenerateContentResponse = serde_json::from_value(body.clone())?;
        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| CodecError::MissingField("candidates".to_string()))?;

        let content: Vec<ContentBlock> = candidate
            .content
            .as_ref()
            .map(|c| c.parts.iter().filter_map(decode_part).collect())
            .unwrap_or_default();

        let has_tool_calls = content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let finish_reason = if has_tool_calls {
            FinishReason::ToolCalls
        } else {
            candidate
                .finish_reason
                .as_deref()
                .map(finish_reason_from_wire)
                .unwrap_or(FinishReason::Stop)
        };

        Ok(Some(CanonicalResponse {
            id: response.response_id.unwrap_or_default(),
            model: response.model_version.unwrap_or_default(),
            content,
            finish_reason,
            usage: response
                .usage_metadata
                .map(|u| Usage {
                    input_tokens: u.prompt_token_count,
                    output_tokens: u.candidates_token_count,
                    reasoning_tokens: u.thoughts_token_count,
                })
                .unwrap_or_default(),
            reasoning_summary: None,
        }))
    }

    fn decode_stream_frame(
        &self,
        frame: &SseFrame,
    ) -> Result<Option<Vec<StreamSignal>>, CodecError> {
        // No event names on this wire; claim JSON frames that look like
        // generation chunks.
        let Some(data) = frame.data_json() else {
            return Ok(None);
        };
        if data.get("candidates").is_none() && data.get("usageMetadata").is_none() {
            return Ok(None);
        }
        let chunk: GenerateContentResponse = serde_json::from_value(data)?;

        let mut signals = Vec::new();
        let mut tool_slot = 0;
        for candidate in &chunk.candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(call) = &part.function_call {
                        let key = TOOL_KEY_BASE + tool_slot;
                        tool_slot += 1;
                        signals.push(StreamSignal::BlockAdded {
                            key,
                            kind: BlockKind::ToolUse {
                                id: call.name.clone(),
                                name: call.name.clone(),
                            },
                        });
                        signals.push(StreamSignal::ArgumentsDelta {
                            key,
                            partial_json: call.args.to_string(),
                        });
                        signals.push(StreamSignal::BlockDone { key });
                    } else if let Some(text) = &part.text {
                        if text.is_empty() {
                            continue;
                        }
                        if part.thought == Some(true) {
                            signals.push(StreamSignal::ThinkingDelta {
                                key: THOUGHT_KEY,
                                text: text.clone(),
                            });
                        } else {
                            signals.push(StreamSignal::TextDelta {
                                key: TEXT_KEY,
                                text: text.clone(),
                            });
                        }
                    }
                }
            }
            if let Some(reason) = &candidate.finish_reason {
                signals.push(StreamSignal::FinishReported {
                    reason: finish_reason_from_wire(reason),
                });
            }
        }
        if let Some(usage) = &chunk.usage_metadata {
            signals.push(StreamSignal::UsageReported {
                usage: Usage {
                    input_tokens: usage.prompt_token_count,
                    output_tokens: usage.candidates_token_count,
                    reasoning_tokens: usage.thoughts_token_count,
                },
            });
        }
        if signals.is_empty() {
            signals.push(StreamSignal::Ignore);
        }
        Ok(Some(signals))
    }

    fn authenticate(&self, wire: WireRequest, api_key: &str) -> WireRequest {
        wire.header("x-goog-api-key", api_key)
    }
}
