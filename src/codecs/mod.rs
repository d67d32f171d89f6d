//! Provider codecs: pure translations between the canonical model and
//! provider wire formats.
//!
//! A codec implements up to four operations, each defaulting to identity,
//! so adjustment codecs override only what they touch. Codecs compose into
//! a [`CodecChain`]: requests are encoded left to right, responses decoded
//! right to left. The leftmost codec speaks the provider's wire format;
//! codecs to its right adjust the outbound body, codecs to its left would
//! post-process the decoded canonical response.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::canonical::{CanonicalRequest, CanonicalResponse, ExtractText};
use crate::error::{CodecError, GatewayError};
use crate::models::{ModelCapabilities, SamplingParam};
use crate::streaming::{SseFrame, StreamSignal};

pub mod adjust;
pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod responses;

pub use adjust::ReasoningAdjustCodec;
pub use anthropic::AnthropicCodec;
pub use gemini::GeminiCodec;
pub use openai::OpenAICodec;
pub use responses::ResponsesCodec;

/// An outbound provider request before transport: target path, headers,
/// and the JSON body the codec chain has built so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl WireRequest {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The body as a mutable object map, replacing anything non-object.
    pub fn body_object(&mut self) -> &mut Map<String, Value> {
        if !self.body.is_object() {
            self.body = Value::Object(Map::new());
        }
        match self.body {
            Value::Object(ref mut map) => map,
            _ => unreachable!(),
        }
    }
}

/// One translation step. Every operation is pure: codecs hold no
/// per-request state and never perform I/O.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build or adjust the outbound wire request. The chain threads `wire`
    /// through every codec; base codecs replace the body, adjustment codecs
    /// tweak it.
    fn encode_request(
        &self,
        request: &CanonicalRequest,
        wire: WireRequest,
    ) -> Result<WireRequest, CodecError> {
        let _ = request;
        Ok(wire)
    }

    /// Decode a buffered response body. `decoded` carries the canonical
    /// response produced by codecs to the right; `None` means nobody has
    /// decoded it yet.
    fn decode_response(
        &self,
        body: &Value,
        decoded: Option<CanonicalResponse>,
    ) -> Result<Option<CanonicalResponse>, CodecError> {
        let _ = body;
        Ok(decoded)
    }

    /// Decode one SSE frame into stream signals. `Ok(None)` means this
    /// codec does not speak the frame's vocabulary.
    fn decode_stream_frame(
        &self,
        frame: &SseFrame,
    ) -> Result<Option<Vec<StreamSignal>>, CodecError> {
        let _ = frame;
        Ok(None)
    }

    /// Attach provider credentials to the outbound request.
    fn authenticate(&self, wire: WireRequest, api_key: &str) -> WireRequest {
        let _ = api_key;
        wire
    }
}

/// An ordered codec composition for one resolved provider/model pair.
#[derive(Clone)]
pub struct CodecChain {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecChain {
    pub fn new(codecs: Vec<Arc<dyn Codec>>) -> Self {
        CodecChain { codecs }
    }

    pub fn encode(&self, request: &CanonicalRequest) -> Result<WireRequest, CodecError> {
        let mut wire = WireRequest::default();
        for codec in &self.codecs {
            wire = codec.encode_request(request, wire)?;
        }
        Ok(wire)
    }

    pub fn decode(&self, body: &Value) -> Result<CanonicalResponse, CodecError> {
        let mut decoded = None;
        for codec in self.codecs.iter().rev() {
            decoded = codec.decode_response(body, decoded)?;
        }
        decoded.ok_or_else(|| {
            CodecError::UnsupportedConversion("no codec in the chain decoded the response".into())
        })
    }

    /// Frame decode is delegated to the rightmost codec that recognizes
    /// the frame; unrecognized frames are skipped with a diagnostic.
    pub fn decode_frame(&self, frame: &SseFrame) -> Result<Vec<StreamSignal>, CodecError> {
        for codec in self.codecs.iter().rev() {
            if let Some(signals) = codec.decode_stream_frame(frame)? {
                return Ok(signals);
            }
        }
        log::debug!("skipping stream frame no codec recognized: {:?}", frame.event);
        Ok(Vec::new())
    }

    pub fn authenticate(&self, mut wire: WireRequest, api_key: &str) -> WireRequest {
        for codec in &self.codecs {
            wire = codec.authenticate(wire, api_key);
        }
        wire
    }
}

/// Named codecs, built once at startup and only read afterwards.
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn with_builtin_codecs() -> Self {
        let mut registry = CodecRegistry {
            codecs: HashMap::new(),
        };
        registry.insert(Arc::new(OpenAICodec));
        registry.insert(Arc::new(ResponsesCodec));
        registry.insert(Arc::new(AnthropicCodec));
        registry.insert(Arc::new(GeminiCodec));
        registry.insert(Arc::new(ReasoningAdjustCodec));
        registry
    }

    fn insert(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name(), codec);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(name).cloned()
    }

    /// Resolve an ordered list of codec names into a chain.
    pub fn chain(&self, names: &[&str]) -> Result<CodecChain, GatewayError> {
        let mut codecs = Vec::with_capacity(names.len());
        for name in names {
            let codec = self
                .get(name)
                .ok_or_else(|| GatewayError::Validation(format!("unknown codec '{}'", name)))?;
            codecs.push(codec);
        }
        Ok(CodecChain::new(codecs))
    }
}

/// Appended to the last user turn when a JSON response format is requested
/// but the conversation never says "json"; some providers reject json mode
/// otherwise.
pub(crate) const JSON_MODE_INSTRUCTION: &str = "Respond with a valid JSON object.";

pub(crate) fn mentions_json(request: &CanonicalRequest) -> bool {
    if let Some(system) = &request.system {
        if system.to_lowercase().contains("json") {
            return true;
        }
    }
    request
        .messages
        .iter()
        .any(|m| m.content.extract_text().to_lowercase().contains("json"))
}

/// Insert a sampling parameter unless the capability table says the model
/// rejects it; stripping is an adjustment, not an error.
pub(crate) fn push_sampling(
    body: &mut Map<String, Value>,
    caps: &ModelCapabilities,
    param: SamplingParam,
    wire_name: &str,
    value: Option<f32>,
) {
    let Some(value) = value else { return };
    if caps.unsupported_sampling.contains(&param) {
        log::debug!(
            "stripping '{}' for '{}' family models",
            wire_name,
            caps.prefix
        );
        return;
    }
    body.insert(wire_name.to_string(), Value::from(value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Message;

    struct TagCodec(&'static str);

    impl Codec for TagCodec {
        fn name(&self) -> &'static str {
            self.0
        }

        fn encode_request(
            &self,
            _request: &CanonicalRequest,
            mut wire: WireRequest,
        ) -> Result<WireRequest, CodecError> {
            let body = wire.body_object();
            let order = body
                .entry("order")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = order {
                items.push(Value::from(self.0));
            }
            Ok(wire)
        }
    }

    #[test]
    fn test_chain_encodes_left_to_right() {
        let chain = CodecChain::new(vec![
            Arc::new(TagCodec("left")),
            Arc::new(TagCodec("right")),
        ]);
        let request = CanonicalRequest::new("gpt-4o", vec![Message::user("hi")]);
        let wire = chain.encode(&request).unwrap();
        assert_eq!(wire.body["order"], serde_json::json!(["left", "right"]));
    }

    #[test]
    fn test_registry_resolves_builtin_chain() {
        let registry = CodecRegistry::with_builtin_codecs();
        assert!(registry.chain(&["openai", "reasoning-adjust"]).is_ok());
        assert!(matches!(
            registry.chain(&["no-such-codec"]),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_decode_with_no_capable_codec_errors() {
        let chain = CodecChain::new(vec![Arc::new(TagCodec("only"))]);
        let err = chain.decode(&serde_json::json!({})).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedConversion(_)));
    }

    #[test]
    fn test_json_mention_detection() {
        let mut request = CanonicalRequest::new("gpt-4o", vec![Message::user("hello")]);
        assert!(!mentions_json(&request));
        request.system = Some("Always answer in JSON.".to_string());
        assert!(mentions_json(&request));
    }
}
