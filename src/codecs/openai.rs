//! OpenAI-style chat completions codec (stateless full-history protocol).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;

use crate::canonical::{
    CanonicalRequest, CanonicalResponse, ContentBlock, FinishReason, Message, ResponseFormat,
    Role, Usage, REFUSAL_PREFIX,
};
use crate::codecs::{mentions_json, push_sampling, Codec, WireRequest, JSON_MODE_INSTRUCTION};
use crate::error::CodecError;
use crate::models::{capabilities_for, compute_limit, SamplingParam};
use crate::streaming::{SseFrame, StreamSignal};

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

// Provider block keys for the state machine. Chat completions stream one
// text channel, one refusal channel, and index-addressed tool-call slots.
const TEXT_KEY: u32 = 0;
const REFUSAL_KEY: u32 = 1;
const TOOL_KEY_BASE: u32 = 16;

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
struct ChatMessage {
    role: String,
    content: Option<Value>,
    tool_calls: Option<Vec<ChatToolCall>>,
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: ChatFunctionCall,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct ChatFunctionCall {
    name: String,
    /// Serialized JSON, exactly as the provider carries it.
    arguments: String,
}

#[derive(Deserialize, Debug)]
struct ChatCompletionsResponse {
    id: String,
    model: String,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ChatChoiceMessage {
    content: Option<String>,
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Deserialize, Debug)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Deserialize, Debug)]
struct CompletionTokensDetails {
    reasoning_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct ChatCompletionsChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize, Debug)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ChunkDelta {
    role: Option<String>,
    content: Option<String>,
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Deserialize, Debug)]
struct ChunkToolCall {
    index: u32,
    id: Option<String>,
    function: Option<ChunkFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct ChunkFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

fn finish_reason_from_wire(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::Refusal,
        _ => FinishReason::Stop,
    }
}

fn data_url(media_type: &str, data: &str) -> String {
    format!("data:{};base64,{}", media_type, data)
}

/// Chat-completions `content`: a bare string when the turn is plain text,
/// an array of typed parts otherwise.
fn encode_content(message: &Message, appended_instruction: Option<&str>) -> Option<Value> {
    let mut parts = Vec::new();
    let mut all_text = true;
    for block in &message.content {
        match block {
            ContentBlock::Text { text } => parts.push(json!({"type": "text", "text": text})),
            ContentBlock::Image { media_type, data } => {
                all_text = false;
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {"url": data_url(media_type, data)}
                }));
            }
            ContentBlock::ToolResult { content, .. } => {
                parts.push(json!({"type": "text", "text": content}))
            }
            // Tool calls ride in `tool_calls`, thinking has no wire slot.
            ContentBlock::ToolUse { .. } | ContentBlock::Thinking { .. } => {}
        }
    }
    if let Some(instruction) = appended_instruction {
        parts.push(json!({"type": "text", "text": instruction}));
    }
    if parts.is_empty() {
        return None;
    }
    if all_text {
        let joined = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");
        return Some(Value::from(joined));
    }
    Some(Value::Array(parts))
}

fn encode_tool_calls(message: &Message) -> Result<Option<Vec<ChatToolCall>>, CodecError> {
    let calls: Vec<ChatToolCall> = message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id, name, input)),
            _ => None,
        })
        .map(|(id, name, input)| {
            Ok(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatFunctionCall {
                    name: name.clone(),
                    arguments: serde_json::to_string(input)?,
                },
            })
        })
        .collect::<Result<_, CodecError>>()?;
    Ok(if calls.is_empty() { None } else { Some(calls) })
}

fn encode_message(
    message: &Message,
    appended_instruction: Option<&str>,
) -> Result<ChatMessage, CodecError> {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    Ok(ChatMessage {
        role: role.to_string(),
        content: encode_content(message, appended_instruction),
        tool_calls: if message.role == Role::Assistant {
            encode_tool_calls(message)?
        } else {
            None
        },
        tool_call_id: message.tool_call_id.clone(),
    })
}

fn decode_tool_call(call: &ChatToolCall) -> ContentBlock {
    let input = match serde_json::from_str(&call.function.arguments) {
        Ok(value) => value,
        Err(_) => {
            log::warn!(
                "tool call '{}' carried unparseable arguments, kept raw",
                call.id
            );
            Value::String(call.function.arguments.clone())
        }
    };
    ContentBlock::ToolUse {
        id: call.id.clone(),
        name: call.function.name.clone(),
        input,
    }
}

fn decode_usage(usage: &ChatUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        reasoning_tokens: usage
            .completion_tokens_details
            .as_ref()
            .and_then(|d| d.reasoning_tokens),
    }
}

pub struct OpenAICodec;

impl OpenAICodec {
    fn encode_body(&self, request: &CanonicalRequest) -> Result<Value, CodecError> {
        let caps = capabilities_for(&request.model);

        // The literal token "json" must appear somewhere in the prompt for
        // json mode; appending an instruction beats rejecting the request.
        let needs_json_nudge = matches!(
            request.response_format,
            Some(ResponseFormat::JsonObject) | Some(ResponseFormat::JsonSchema { .. })
        ) && !mentions_json(request);
        let last_user_pos = request
            .messages
            .iter()
            .rposition(|m| m.role == Role::User);

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(Value::from(system.clone())),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        for (pos, message) in request.messages.iter().enumerate() {
            let nudge = (needs_json_nudge && last_user_pos == Some(pos))
                .then_some(JSON_MODE_INSTRUCTION);
            messages.push(encode_message(message, nudge)?);
        }

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), Value::from(request.model.clone()));
        body.insert("messages".to_string(), serde_json::to_value(&messages)?);

        if let Some(tools) = &request.tools {
            let encoded: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
            body.insert("tools".to_string(), Value::Array(encoded));
        }

        match &request.response_format {
            None | Some(ResponseFormat::Text) => {}
            Some(ResponseFormat::JsonObject) => {
                body.insert("response_format".to_string(), json!({"type": "json_object"}));
            }
            Some(ResponseFormat::JsonSchema {
                name,
                schema,
                strict,
            }) => {
                let format = if caps.supports_json_schema {
                    json!({
                        "type": "json_schema",
                        "json_schema": {"name": name, "schema": schema, "strict": strict}
                    })
                } else {
                    // Degrade to plain json mode rather than fail.
                    log::debug!(
                        "'{}' family does not take a json schema, downgrading to json mode",
                        caps.prefix
                    );
                    json!({"type": "json_object"})
                };
                body.insert("response_format".to_string(), format);
            }
        }

        if let Some(prediction) = &request.prediction {
            if caps.supports_prediction {
                body.insert(
                    "prediction".to_string(),
                    json!({"type": "content", "content": prediction}),
                );
            } else {
                log::debug!("'{}' family ignores prediction, dropped", caps.prefix);
            }
        }

        let limit = compute_limit(
            caps,
            request.max_tokens,
            request.tool_count(),
            request.messages.len(),
        );
        body.insert(caps.token_param.wire_name().to_string(), Value::from(limit));

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
            body.insert(
                "stream_options".to_string(),
                json!({"include_usage": true}),
            );
        }
        Ok(Value::Object(body))
    }
}

impl Codec for OpenAICodec {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn encode_request(
        &self,
        request: &CanonicalRequest,
        mut wire: WireRequest,
    ) -> Result<WireRequest, CodecError> {
        wire.path = CHAT_COMPLETIONS_PATH.to_string();
        wire.body = self.encode_body(request)?;
        Ok(wire)
    }

    fn decode_response(
        &self,
        body: &Value,
        _decoded: Option<CanonicalResponse>,
    ) -> Result<Option<CanonicalResponse>, CodecError> {
        let response: ChatCompletionsResponse = serde_json::from_value(body.clone())?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CodecError::MissingField("choices".to_string()))?;

        let mut content = Vec::new();
        let mut finish_reason = choice
            .finish_reason
            .as_deref()
            .map(finish_reason_from_wire)
            .unwrap_or(FinishReason::Stop);

        if let Some(refusal) = &choice.message.refusal {
            content.push(ContentBlock::Text {
                text: format!("{}{}", REFUSAL_PREFIX, refusal),
            });
            finish_reason = FinishReason::Refusal;
        } else if let Some(text) = &choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::Text { text: text.clone() });
            }
        }
        for call in &choice.message.tool_calls {
            content.push(decode_tool_call(call));
        }

        Ok(Some(CanonicalResponse {
            id: response.id,
            model: response.model,
            content,
            finish_reason,
            usage: response.usage.as_ref().map(decode_usage).unwrap_or_default(),
            reasoning_summary: None,
        }))
    }

    fn decode_stream_frame(
        &self,
        frame: &SseFrame,
    ) -> Result<Option<Vec<StreamSignal>>, CodecError> {
        let Some(data) = frame.data_json() else {
            return Ok(None);
        };
        let chunk: ChatCompletionsChunk = serde_json::from_value(data)?;

        let mut signals = Vec::new();
        for choice in &chunk.choices {
            if choice.delta.role.is_some() {
                signals.push(StreamSignal::MessageStart {
                    id: chunk.id.clone(),
                    model: chunk.model.clone(),
                });
            }
            if let Some(text) = &choice.delta.content {
                if !text.is_empty() {
                    signals.push(StreamSignal::TextDelta {
                        key: TEXT_KEY,
                        text: text.clone(),
                    });
                }
            }
            if let Some(refusal) = &choice.delta.refusal {
                if !refusal.is_empty() {
                    signals.push(StreamSignal::RefusalDelta {
                        key: REFUSAL_KEY,
                        text: refusal.clone(),
                    });
                }
            }
            for call in &choice.delta.tool_calls {
                let key = TOOL_KEY_BASE + call.index;
                if let Some(name) = call.function.as_ref().and_then(|f| f.name.as_deref()) {
                    signals.push(StreamSignal::BlockAdded {
                        key,
                        kind: crate::canonical::BlockKind::ToolUse {
                            id: call.id.clone().unwrap_or_default(),
                            name: name.to_string(),
                        },
                    });
                }
                if let Some(arguments) = call.function.as_ref().and_then(|f| f.arguments.as_deref())
                {
                    if !arguments.is_empty() {
                        signals.push(StreamSignal::ArgumentsDelta {
                            key,
                            partial_json: arguments.to_string(),
                        });
                    }
                }
            }
            if let Some(reason) = &choice.finish_reason {
                signals.push(StreamSignal::FinishReported {
                    reason: finish_reason_from_wire(reason),
                });
            }
        }
        if let Some(usage) = &chunk.usage {
            signals.push(StreamSignal::UsageReported {
                usage: decode_usage(usage),
            });
        }
        if signals.is_empty() {
            signals.push(StreamSignal::Ignore);
        }
        Ok(Some(signals))
    }

    fn authenticate(&self, wire: WireRequest, api_key: &str) -> WireRequest {
        wire.header("Authorization", format!("Bearer {}", api_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::ToolSpec;
    use serde_json::json;

    fn codec() -> OpenAICodec {
        OpenAICodec
    }

    fn encode(request: &CanonicalRequest) -> Value {
        codec()
            .encode_request(request, WireRequest::default())
            .unwrap()
            .body
    }

    #[test]
    fn test_encode_renames_token_param_per_model() {
        let mut request = CanonicalRequest::new("gpt-4o", vec![Message::user("hi")]);
        request.max_tokens = Some(1000);
        let body = encode(&request);
        assert_eq!(body["max_completion_tokens"], 1000);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_encode_strips_sampling_for_reasoning_models() {
        let mut request = CanonicalRequest::new("o3-mini", vec![Message::user("hi")]);
        request.temperature = Some(0.7);
        request.top_p = Some(0.9);
        let body = encode(&request);
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn test_encode_appends_json_instruction_when_absent() {
        let mut request = CanonicalRequest::new(
            "gpt-4o",
            vec![Message::user("Give me the top three cities by population")],
        );
        request.response_format = Some(ResponseFormat::JsonObject);
        let body = encode(&request);
        assert_eq!(body["response_format"]["type"], "json_object");
        let last_user = body["messages"][0]["content"].as_str().unwrap();
        assert!(last_user.contains(JSON_MODE_INSTRUCTION));

        // Conversations already mentioning json are left alone.
        let mut request = CanonicalRequest::new(
            "gpt-4o",
            vec![Message::user("Reply in JSON with the top three cities")],
        );
        request.response_format = Some(ResponseFormat::JsonObject);
        let body = encode(&request);
        let last_user = body["messages"][0]["content"].as_str().unwrap();
        assert!(!last_user.contains(JSON_MODE_INSTRUCTION));
    }

    #[test]
    fn test_encode_assistant_tool_calls_and_tool_results() {
        let request = CanonicalRequest::new(
            "gpt-4o",
            vec![
                Message::user("What's the weather in Paris?"),
                Message {
                    role: Role::Assistant,
                    content: vec![ContentBlock::ToolUse {
                        id: "call_1".to_string(),
                        name: "get_weather".to_string(),
                        input: json!({"city": "Paris"}),
                    }],
                    tool_call_id: None,
                },
                Message::tool_result("call_1", "18C, clear"),
            ],
        );
        let body = encode(&request);
        let assistant = &body["messages"][1];
        assert_eq!(assistant["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            assistant["tool_calls"][0]["function"]["name"],
            "get_weather"
        );
        let tool = &body["messages"][2];
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "call_1");
    }

    #[test]
    fn test_encode_tools_with_stream_options() {
        let mut request = CanonicalRequest::new("gpt-4o", vec![Message::user("hi")]);
        request.tools = Some(vec![ToolSpec {
            name: "lookup".to_string(),
            description: Some("Look something up".to_string()),
            parameters: json!({"type": "object", "properties": {}}),
        }]);
        request.stream = true;
        let body = encode(&request);
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_decode_normalizes_tool_calls() {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 12}
        });
        let response = codec().decode_response(&body, None).unwrap().unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        match &response.content[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_9");
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Paris");
            }
            other => panic!("expected tool use, got {:?}", other),
        }
        assert_eq!(response.usage.input_tokens, 20);
    }

    #[test]
    fn test_decode_refusal_becomes_marked_text() {
        let body = json!({
            "id": "chatcmpl-2",
            "model": "gpt-4o",
            "choices": [{
                "message": {"refusal": "I can't help with that."},
                "finish_reason": "stop"
            }]
        });
        let response = codec().decode_response(&body, None).unwrap().unwrap();
        assert_eq!(response.finish_reason, FinishReason::Refusal);
        match &response.content[0] {
            ContentBlock::Text { text } => {
                assert!(text.starts_with(REFUSAL_PREFIX));
                assert!(text.contains("can't help"));
            }
            other => panic!("expected text, got {:?}", other),
        }
    }

    fn data_frame(value: Value) -> SseFrame {
        SseFrame {
            event: None,
            data: Some(value.to_string()),
        }
    }

    #[test]
    fn test_stream_text_and_finish_signals() {
        let c = codec();
        let first = c
            .decode_stream_frame(&data_frame(json!({
                "id": "chatcmpl-3",
                "model": "gpt-4o",
                "choices": [{"delta": {"role": "assistant", "content": "Hel"}}]
            })))
            .unwrap()
            .unwrap();
        assert_eq!(
            first[0],
            StreamSignal::MessageStart {
                id: "chatcmpl-3".to_string(),
                model: "gpt-4o".to_string()
            }
        );
        assert_eq!(
            first[1],
            StreamSignal::TextDelta {
                key: TEXT_KEY,
                text: "Hel".to_string()
            }
        );

        let last = c
            .decode_stream_frame(&data_frame(json!({
                "choices": [{"delta": {}, "finish_reason": "length"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 7}
            })))
            .unwrap()
            .unwrap();
        assert!(last.contains(&StreamSignal::FinishReported {
            reason: FinishReason::Length
        }));
        assert!(matches!(
            last.last(),
            Some(StreamSignal::UsageReported { usage }) if usage.output_tokens == 7
        ));
    }

    #[test]
    fn test_stream_tool_call_fragments_keep_slot_keys() {
        let c = codec();
        let opened = c
            .decode_stream_frame(&data_frame(json!({
                "choices": [{"delta": {"tool_calls": [{
                    "index": 0,
                    "id": "call_1",
                    "function": {"name": "get_weather", "arguments": ""}
                }]}}]
            })))
            .unwrap()
            .unwrap();
        assert!(matches!(
            &opened[0],
            StreamSignal::BlockAdded { key, .. } if *key == TOOL_KEY_BASE
        ));

        let fragment = c
            .decode_stream_frame(&data_frame(json!({
                "choices": [{"delta": {"tool_calls": [{
                    "index": 0,
                    "function": {"arguments": "{\"city\":"}
                }]}}]
            })))
            .unwrap()
            .unwrap();
        assert_eq!(
            fragment[0],
            StreamSignal::ArgumentsDelta {
                key: TOOL_KEY_BASE,
                partial_json: "{\"city\":".to_string()
            }
        );
    }

    #[test]
    fn test_stream_refusal_deltas_use_refusal_signal() {
        let c = codec();
        let signals = c
            .decode_stream_frame(&data_frame(json!({
                "choices": [{"delta": {"refusal": "I can't help with that."}}]
            })))
            .unwrap()
            .unwrap();
        assert_eq!(
            signals[0],
            StreamSignal::RefusalDelta {
                key: REFUSAL_KEY,
                text: "I can't help with that.".to_string()
            }
        );
    }

    #[test]
    fn test_non_json_frames_are_not_claimed() {
        let frame = SseFrame {
            event: None,
            data: Some("not json".to_string()),
        };
        assert!(codec().decode_stream_frame(&frame).unwrap().is_none());
    }

    #[test]
    fn test_authenticate_sets_bearer_header() {
        let wire = codec().authenticate(WireRequest::default(), "sk-test");
        assert!(wire
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer sk-test"));
    }
}
