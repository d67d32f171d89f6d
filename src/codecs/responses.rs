//! OpenAI Responses codec: the stateful variant of the OpenAI protocol.
//!
//! Content parts are tagged by direction, not by role name: everything the
//! caller sends is an `input_*` part, everything the model produced is an
//! `output_*` part. Conversation state lives upstream; a request that
//! carries `previous_response_id` sends only the turns after the last
//! assistant message.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{
    BlockKind, CanonicalRequest, CanonicalResponse, ContentBlock, FinishReason, Message,
    ResponseFormat, Role, Usage, REFUSAL_PREFIX,
};
use crate::codecs::{mentions_json, push_sampling, Codec, WireRequest, JSON_MODE_INSTRUCTION};
use crate::error::CodecError;
use crate::models::{capabilities_for, compute_limit, SamplingParam};
use crate::streaming::{SseFrame, StreamSignal};

pub const RESPONSES_PATH: &str = "/v1/responses";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem {
    Message {
        role: String,
        content: Vec<Value>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Deserialize, Debug)]
struct ResponsesResponse {
    id: String,
    model: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: Vec<OutputItem>,
    usage: Option<ResponsesUsage>,
    incomplete_details: Option<IncompleteDetails>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<SummaryPart>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputPart {
    OutputText { text: String },
    Refusal { refusal: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
struct SummaryPart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct ResponsesUsage {
    input_tokens: u32,
    output_tokens: u32,
    output_tokens_details: Option<OutputTokensDetails>,
}

#[derive(Deserialize, Debug)]
struct OutputTokensDetails {
    reasoning_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct IncompleteDetails {
    #[serde(default)]
    reason: String,
}

/// Direction tag for content parts sent to the provider.
fn input_part_type(role: Role) -> &'static str {
    match role {
        Role::Assistant => "output_text",
        _ => "input_text",
    }
}

fn encode_parts(message: &Message, appended_instruction: Option<&str>) -> Vec<Value> {
    let text_type = input_part_type(message.role);
    let mut parts = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::Text { text } => parts.push(json!({"type": text_type, "text": text})),
            ContentBlock::Image { media_type, data } => parts.push(json!({
                "type": "input_image",
                "image_url": format!("data:{};base64,{}", media_type, data)
            })),
            ContentBlock::ToolResult { content, .. } => {
                parts.push(json!({"type": text_type, "text": content}))
            }
            ContentBlock::ToolUse { .. } | ContentBlock::Thinking { .. } => {}
        }
    }
    if let Some(instruction) = appended_instruction {
        parts.push(json!({"type": text_type, "text": instruction}));
    }
    parts
}

fn encode_item(
    message: &Message,
    appended_instruction: Option<&str>,
) -> Result<Vec<InputItem>, CodecError> {
    // Tool turns become standalone function_call_output items; tool calls
    // inside an assistant turn become function_call items.
    if message.role == Role::Tool {
        let call_id = message
            .tool_call_id
            .clone()
            .ok_or_else(|| CodecError::MissingField("tool_call_id".to_string()))?;
        let output = message
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(vec![InputItem::FunctionCallOutput { call_id, output }]);
    }

    let mut items = Vec::new();
    let parts = encode_parts(message, appended_instruction);
    if !parts.is_empty() {
        // Tool turns returned above.
        let role = match message.role {
            Role::System => "system",
            Role::Assistant => "assistant",
            _ => "user",
        };
        items.push(InputItem::Message {
            role: role.to_string(),
            content: parts,
        });
    }
    for block in &message.content {
        if let ContentBlock::ToolUse { id, name, input } = block {
            items.push(InputItem::FunctionCall {
                call_id: id.clone(),
                name: name.clone(),
                arguments: serde_json::to_string(input)?,
            });
        }
    }
    Ok(items)
}

/// With `previous_response_id`, the provider replays the stored history;
/// only turns after the last assistant message go on the wire.
fn new_turns(messages: &[Message]) -> &[Message] {
    let start = messages
        .iter()
        .rposition(|m| m.role == Role::Assistant)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    &messages[start..]
}

pub struct ResponsesCodec;

impl Codec for ResponsesCodec {
    fn name(&self) -> &'static str {
        "responses"
    }

    fn encode_request(
        &self,
        request: &CanonicalRequest,
        mut wire: WireRequest,
    ) -> Result<WireRequest, CodecError> {
        let caps = capabilities_for(&request.model);

        let messages: &[Message] = if request.previous_response_id.is_some() {
            new_turns(&request.messages)
        } else {
            &request.messages
        };

        let needs_json_nudge = matches!(
            request.response_format,
            Some(ResponseFormat::JsonObject) | Some(ResponseFormat::JsonSchema { .. })
        ) && !mentions_json(request);
        let last_user_pos = messages.iter().rposition(|m| m.role == Role::User);

        let mut input = Vec::new();
        for (pos, message) in messages.iter().enumerate() {
            let nudge = (needs_json_nudge && last_user_pos == Some(pos))
                .then_some(JSON_MODE_INSTRUCTION);
            input.extend(encode_item(message, nudge)?);
        }

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), Value::from(request.model.clone()));
        body.insert("input".to_string(), serde_json::to_value(&input)?);
        if let Some(system) = &request.system {
            body.insert("instructions".to_string(), Value::from(system.clone()));
        }
        if let Some(previous) = &request.previous_response_id {
            body.insert(
                "previous_response_id".to_string(),
                Value::from(previous.clone()),
            );
        }
        if let Some(tools) = &request.tools {
            let encoded: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect();
            body.insert("tools".to_string(), Value::Array(encoded));
        }
        match &request.response_format {
            None | Some(ResponseFormat::Text) => {}
            Some(ResponseFormat::JsonObject) => {
                body.insert("text".to_string(), json!({"format": {"type": "json_object"}}));
            }
            Some(ResponseFormat::JsonSchema {
                name,
                schema,
                strict,
            }) => {
                body.insert(
                    "text".to_string(),
                    json!({"format": {
                        "type": "json_schema",
                        "name": name,
                        "schema": schema,
                        "strict": strict
                    }}),
                );
            }
        }

        let limit = compute_limit(
            caps,
            request.max_tokens,
            request.tool_count(),
            request.messages.len(),
        );
        body.insert("max_output_tokens".to_string(), Value::from(limit));

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
        // The provider stores the turn so the next request can reference it.
        body.insert("store".to_string(), Value::Bool(true));

        wire.path = RESPONSES_PATH.to_string();
        wire.body = Value::Object(body);
        Ok(wire)
    }

    fn decode_response(
        &self,
        body: &Value,
        _decoded: Option<CanonicalResponse>,
    ) -> Result<Option<CanonicalResponse>, CodecError> {
        let response: ResponsesResponse = serde_json::from_value(body.clone())?;

        let mut content = Vec::new();
        let mut reasoning_summary: Option<String> = None;
        let mut saw_refusal = false;
        for item in &response.output {
            match item {
                OutputItem::Message { content: parts } => {
                    for part in parts {
                        match part {
                            OutputPart::OutputText { text } => {
                                content.push(ContentBlock::Text { text: text.clone() })
                            }
                            OutputPart::Refusal { refusal } => {
                                saw_refusal = true;
                                content.push(ContentBlock::Text {
                                    text: format!("{}{}", REFUSAL_PREFIX, refusal),
                                });
                            }
                            OutputPart::Unknown => {}
                        }
                    }
                }
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    let input = serde_json::from_str(arguments).unwrap_or_else(|_| {
                        log::warn!("function call '{}' carried unparseable arguments", call_id);
                        Value::String(arguments.clone())
                    });
                    content.push(ContentBlock::ToolUse {
                        id: call_id.clone(),
                        name: name.clone(),
                        input,
                    });
                }
                OutputItem::Reasoning { summary } => {
                    let text = summary
                        .iter()
                        .map(|s| s.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    if !text.is_empty() {
                        reasoning_summary = Some(text);
                    }
                }
                OutputItem::Unknown => {}
            }
        }

        let has_tool_calls = content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let finish_reason = if saw_refusal {
            FinishReason::Refusal
        } else if response
            .incomplete_details
            .as_ref()
            .is_some_and(|d| d.reason == "max_output_tokens")
        {
            FinishReason::Length
        } else if has_tool_calls {
            FinishReason::ToolCalls
        } else if response.status == "failed" {
            FinishReason::Error
        } else {
            FinishReason::Stop
        };

        Ok(Some(CanonicalResponse {
            id: response.id,
            model: response.model,
            content,
            finish_reason,
            usage: response
                .usage
                .map(|u| Usage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                    reasoning_tokens: u
                        .output_tokens_details
                        .and_then(|d| d.reasoning_tokens),
                })
                .unwrap_or_default(),
            reasoning_summary,
        }))
    }

    fn decode_stream_frame(
        &self,
        frame: &SseFrame,
    ) -> Result<Option<Vec<StreamSignal>>, CodecError> {
        let Some(event) = frame.event.as_deref() else {
            return Ok(None);
        };
        if !event.starts_with("response.") {
            return Ok(None);
        }
        let data = frame
            .data_json()
            .ok_or_else(|| CodecError::MissingField("data".to_string()))?;
        let output_index = data["output_index"].as_u64().unwrap_or(0) as u32;

        let signals = match event {
            "response.created" => vec![StreamSignal::MessageStart {
                id: data["response"]["id"].as_str().unwrap_or_default().to_string(),
                model: data["response"]["model"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            }],
            "response.output_item.added" => {
                let item = &data["item"];
                let kind = match item["type"].as_str() {
                    Some("function_call") => BlockKind::ToolUse {
                        id: item["call_id"].as_str().unwrap_or_default().to_string(),
                        name: item["name"].as_str().unwrap_or_default().to_string(),
                    },
                    Some("reasoning") => BlockKind::Thinking,
                    _ => BlockKind::Text,
                };
                vec![StreamSignal::BlockAdded {
                    key: output_index,
                    kind,
                }]
            }
            "response.output_text.delta" => {
                vec![StreamSignal::TextDelta {
                    key: output_index,
                    text: data["delta"].as_str().unwrap_or_default().to_string(),
                }]
            }
            "response.refusal.delta" => {
                vec![StreamSignal::RefusalDelta {
                    key: output_index,
                    text: data["delta"].as_str().unwrap_or_default().to_string(),
                }]
            }
            "response.reasoning_summary_text.delta" => vec![StreamSignal::ThinkingDelta {
                key: output_index,
                text: data["delta"].as_str().unwrap_or_default().to_string(),
            }],
            "response.function_call_arguments.delta" => vec![StreamSignal::ArgumentsDelta {
                key: output_index,
                partial_json: data["delta"].as_str().unwrap_or_default().to_string(),
            }],
            "response.output_item.done" => vec![StreamSignal::BlockDone { key: output_index }],
            "response.completed" => {
                let response = &data["response"];
                let reported = if response["incomplete_details"]["reason"]
                    .as_str()
                    .is_some_and(|r| r == "max_output_tokens")
                {
                    Some(FinishReason::Length)
                } else {
                    None
                };
                let usage = response.get("usage").and_then(|u| {
                    Some(Usage {
                        input_tokens: u["input_tokens"].as_u64()? as u32,
                        output_tokens: u["output_tokens"].as_u64()? as u32,
                        reasoning_tokens: u["output_tokens_details"]["reasoning_tokens"]
                            .as_u64()
                            .map(|n| n as u32),
                    })
                });
                vec![StreamSignal::Completed { reported, usage }]
            }
            "response.failed" | "response.incomplete" => vec![StreamSignal::Completed {
                reported: Some(if event == "response.failed" {
                    FinishReason::Error
                } else {
                    FinishReason::Length
                }),
                usage: None,
            }],
            _ => vec![StreamSignal::Ignore],
        };
        Ok(Some(signals))
    }

    fn authenticate(&self, wire: WireRequest, api_key: &str) -> WireRequest {
        wire.header("Authorization", format!("Bearer {}", api_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec() -> ResponsesCodec {
        ResponsesCodec
    }

    fn encode(request: &CanonicalRequest) -> Value {
        codec()
            .encode_request(request, WireRequest::default())
            .unwrap()
            .body
    }

    #[test]
    fn test_content_types_follow_direction_not_role() {
        let request = CanonicalRequest::new(
            "gpt-5",
            vec![
                Message::user("hello"),
                Message::assistant("hi there"),
                Message::user("and again"),
            ],
        );
        let body = encode(&request);
        assert_eq!(body["input"][0]["content"][0]["type"], "input_text");
        assert_eq!(body["input"][1]["content"][0]["type"], "output_text");
        assert_eq!(body["input"][2]["content"][0]["type"], "input_text");
    }

    #[test]
    fn test_previous_response_id_sends_only_new_turns() {
        let mut request = CanonicalRequest::new(
            "gpt-5",
            vec![
                Message::user("first question"),
                Message::assistant("first answer"),
                Message::user("follow-up"),
            ],
        );
        request.previous_response_id = Some("resp_abc".to_string());
        let body = encode(&request);
        assert_eq!(body["previous_response_id"], "resp_abc");
        let input = body["input"].as_array().unwrap();
        assert_eq!(input.len(), 1);
        assert_eq!(input[0]["content"][0]["text"], "follow-up");
    }

    #[test]
    fn test_tool_turns_become_function_call_output() {
        let request = CanonicalRequest::new(
            "gpt-5",
            vec![
                Message::user("weather?"),
                Message {
                    role: Role::Assistant,
                    content: vec![ContentBlock::ToolUse {
                        id: "call_1".to_string(),
                        name: "get_weather".to_string(),
                        input: json!({"city": "Paris"}),
                    }],
                    tool_call_id: None,
                },
                Message::tool_result("call_1", "18C"),
            ],
        );
        let body = encode(&request);
        let input = body["input"].as_array().unwrap();
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "call_1");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["output"], "18C");
    }

    #[test]
    fn test_decode_collects_output_items() {
        let body = json!({
            "id": "resp_1",
            "model": "gpt-5",
            "status": "completed",
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "considered the options"}]},
                {"type": "message", "content": [{"type": "output_text", "text": "Paris"}]},
                {"type": "function_call", "call_id": "call_2", "name": "lookup", "arguments": "{\"q\":\"x\"}"}
            ],
            "usage": {"input_tokens": 40, "output_tokens": 30,
                      "output_tokens_details": {"reasoning_tokens": 12}}
        });
        let response = codec().decode_response(&body, None).unwrap().unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(
            response.reasoning_summary.as_deref(),
            Some("considered the options")
        );
        assert_eq!(response.usage.reasoning_tokens, Some(12));
        assert!(matches!(
            &response.content[1],
            ContentBlock::ToolUse { name, .. } if name == "lookup"
        ));
    }

    fn event_frame(event: &str, data: Value) -> SseFrame {
        SseFrame {
            event: Some(event.to_string()),
            data: Some(data.to_string()),
        }
    }

    #[test]
    fn test_penalties_encoded_when_model_accepts_them() {
        let mut request = CanonicalRequest::new("gpt-4o", vec![Message::user("hi")]);
        request.frequency_penalty = Some(0.5);
        request.presence_penalty = Some(0.25);
        let body = encode(&request);
        assert_eq!(body["frequency_penalty"], json!(0.5));
        assert_eq!(body["presence_penalty"], json!(0.25));

        let mut request = CanonicalRequest::new("o3-mini", vec![Message::user("hi")]);
        request.frequency_penalty = Some(0.5);
        let body = encode(&request);
        assert!(body.get("frequency_penalty").is_none());
    }

    #[test]
    fn test_stream_events_key_on_output_index() {
        let c = codec();
        let added = c
            .decode_stream_frame(&event_frame(
                "response.output_item.added",
                json!({"output_index": 2, "item": {"type": "function_call",
                       "call_id": "call_3", "name": "search"}}),
            ))
            .unwrap()
            .unwrap();
        assert_eq!(
            added[0],
            StreamSignal::BlockAdded {
                key: 2,
                kind: BlockKind::ToolUse {
                    id: "call_3".to_string(),
                    name: "search".to_string()
                }
            }
        );

        let delta = c
            .decode_stream_frame(&event_frame(
                "response.output_text.delta",
                json!({"output_index": 0, "delta": "Par"}),
            ))
            .unwrap()
            .unwrap();
        assert_eq!(
            delta[0],
            StreamSignal::TextDelta {
                key: 0,
                text: "Par".to_string()
            }
        );
    }

    #[test]
    fn test_refusal_delta_event_uses_refusal_signal() {
        let signals = codec()
            .decode_stream_frame(&event_frame(
                "response.refusal.delta",
                json!({"output_index": 0, "delta": "I can't do that."}),
            ))
            .unwrap()
            .unwrap();
        assert_eq!(
            signals[0],
            StreamSignal::RefusalDelta {
                key: 0,
                text: "I can't do that.".to_string()
            }
        );
    }

    #[test]
    fn test_completed_event_carries_usage() {
        let signals = codec()
            .decode_stream_frame(&event_frame(
                "response.completed",
                json!({"response": {"usage": {"input_tokens": 9, "output_tokens": 4}}}),
            ))
            .unwrap()
            .unwrap();
        assert!(matches!(
            &signals[0],
            StreamSignal::Completed { usage: Some(u), .. } if u.output_tokens == 4
        ));
    }

    #[test]
    fn test_frames_without_response_events_not_claimed() {
        let frame = SseFrame {
            event: None,
            data: Some("{}".to_string()),
        };
        assert!(codec().decode_stream_frame(&frame).unwrap().is_none());
    }
}
