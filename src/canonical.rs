//! Canonical request/response/content model shared by every codec.
//!
//! Everything here is an immutable value type: codecs construct new values
//! and never mutate their inputs. Message order is conversation order; no
//! codec may reorder messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use crate::error::GatewayError;

/// Prefix applied to the text block synthesized from a provider safety
/// refusal, so existing clients see normal content instead of an error.
pub const REFUSAL_PREFIX: &str = "[refusal] ";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One typed unit of message content. Closed union: every codec's content
/// mapping must be exhaustive over these variants.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: Option<bool>,
    },
    Thinking {
        text: String,
        /// Opaque provider signature; round-tripped verbatim, never parsed.
        signature: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

pub trait ExtractText {
    fn extract_text(&self) -> String;
}

impl ExtractText for Vec<ContentBlock> {
    fn extract_text(&self) -> String {
        self.iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// For `Role::Tool` messages, the tool call this message answers.
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let id = tool_call_id.into();
        Message {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_call_id: id.clone(),
                content: content.into(),
                is_error: None,
            }],
            tool_call_id: Some(id),
        }
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema {
        name: String,
        schema: Value,
        strict: Option<bool>,
    },
}

/// Provider-agnostic chat-completion request.
///
/// Sampling parameters are requests, not guarantees: a codec strips any the
/// resolved model does not support and logs the adjustment.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tools: Option<Vec<ToolSpec>>,
    pub response_format: Option<ResponseFormat>,
    /// Content hint for providers that support speculative/predicted decoding.
    pub prediction: Option<String>,
    /// Raw requested output token limit, before any per-model translation.
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    /// Opaque conversation key for providers with server-side memory.
    pub conversation: Option<String>,
    /// Continuation handle for stateful protocols; resolved from session
    /// state, not supplied by callers directly.
    pub previous_response_id: Option<String>,
}

impl CanonicalRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        CanonicalRequest {
            model: model.into(),
            messages,
            system: None,
            tools: None,
            response_format: None,
            prediction: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stream: false,
            conversation: None,
            previous_response_id: None,
        }
    }

    pub fn tool_count(&self) -> usize {
        self.tools.as_ref().map(|t| t.len()).unwrap_or(0)
    }

    /// Pre-flight validation, run before any upstream call.
    ///
    /// A `tool` message must answer a tool call made by a *preceding*
    /// assistant message in the same request.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut seen_call_ids: Vec<&str> = Vec::new();
        for (i, message) in self.messages.iter().enumerate() {
            match message.role {
                Role::Assistant => {
                    for block in &message.content {
                        if let ContentBlock::ToolUse { id, .. } = block {
                            seen_call_ids.push(id);
                        }
                    }
                }
                Role::Tool => {
                    let call_id = message.tool_call_id.as_deref().ok_or_else(|| {
                        GatewayError::Validation(format!(
                            "tool message at position {} has no tool_call_id",
                            i
                        ))
                    })?;
                    if !seen_call_ids.contains(&call_id) {
                        return Err(GatewayError::Validation(format!(
                            "tool message at position {} references unknown tool_call_id '{}'",
                            i, call_id
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl TryFrom<&[u8]> for CanonicalRequest {
    type Error = serde_json::Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Why an assistant turn ended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Refusal,
    Error,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub reasoning_tokens: Option<u32>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub reasoning_summary: Option<String>,
}

impl CanonicalResponse {
    pub fn tool_calls(&self) -> impl Iterator<Item = &ContentBlock> {
        self.content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }
}

/// The kind of content block opened by a `BlockStart` event.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "kind")]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

/// Incremental payload carried by a `BlockDelta` event.
///
/// Tool-call argument deltas are raw string increments, concatenated
/// verbatim by consumers; they parse as JSON only once the block closes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum Delta {
    Text { text: String },
    Thinking { text: String },
    Signature { signature: String },
    ToolArguments { partial_json: String },
}

/// Canonical streaming event.
///
/// Indices are assigned per response, starting at 0, strictly increasing and
/// never reused; a delta or stop for an index may only follow its start.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum CanonicalStreamEvent {
    MessageStart {
        id: String,
        model: String,
    },
    BlockStart {
        index: u32,
        #[serde(flatten)]
        kind: BlockKind,
    },
    BlockDelta {
        index: u32,
        delta: Delta,
    },
    BlockStop {
        index: u32,
    },
    MessageDelta {
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
    },
    MessageStop,
    Error {
        kind: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_parses_from_bytes() {
        let req = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "Hello!"}]}
            ],
            "stream": true
        });
        let bytes = serde_json::to_vec(&req).unwrap();
        let parsed = CanonicalRequest::try_from(bytes.as_slice()).unwrap();
        assert_eq!(parsed.model, "gpt-4o");
        assert_eq!(parsed.messages.len(), 1);
        assert!(parsed.stream);
    }

    #[test]
    fn test_content_block_round_trips_tagged() {
        let block = ContentBlock::ToolUse {
            id: "call_1".to_string(),
            name: "get_weather".to_string(),
            input: json!({"location": "SF"}),
        };
        let val = serde_json::to_value(&block).unwrap();
        assert_eq!(val["type"], "tool_use");
        let back: ContentBlock = serde_json::from_value(val).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_validate_accepts_tool_message_answering_prior_call() {
        let mut assistant = Message::assistant("");
        assistant.content = vec![ContentBlock::ToolUse {
            id: "call_9".to_string(),
            name: "lookup".to_string(),
            input: json!({}),
        }];
        let req = CanonicalRequest::new(
            "gpt-4o",
            vec![
                Message::user("hi"),
                assistant,
                Message::tool_result("call_9", "42"),
            ],
        );
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_orphan_tool_message() {
        let req = CanonicalRequest::new(
            "gpt-4o",
            vec![Message::user("hi"), Message::tool_result("call_missing", "42")],
        );
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("call_missing"));
    }

    #[test]
    fn test_stream_event_serialization_shape() {
        let event = CanonicalStreamEvent::BlockStart {
            index: 0,
            kind: BlockKind::ToolUse {
                id: "call_1".to_string(),
                name: "get_weather".to_string(),
            },
        };
        let val = serde_json::to_value(&event).unwrap();
        assert_eq!(val["type"], "block_start");
        assert_eq!(val["kind"], "tool_use");
        assert_eq!(val["index"], 0);
    }

    #[test]
    fn test_extract_text_skips_non_text_blocks() {
        let blocks = vec![
            ContentBlock::text("a"),
            ContentBlock::ToolUse {
                id: "x".into(),
                name: "y".into(),
                input: json!({}),
            },
            ContentBlock::text("b"),
        ];
        assert_eq!(blocks.extract_text(), "a\nb");
    }
}
