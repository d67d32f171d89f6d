//! Model-family adjustment codec, chained to the right of a base codec.
//!
//! Reasoning-capable families reject free sampling and want an explicit
//! effort setting; this codec enforces both on the already-encoded wire
//! body and is a wire-level identity for every other family.

use crate::canonical::CanonicalRequest;
use crate::codecs::{Codec, WireRequest};
use crate::error::CodecError;
use crate::models::capabilities_for;

pub const DEFAULT_REASONING_EFFORT: &str = "medium";

const SAMPLING_KEYS: &[&str] = &["temperature", "top_p", "frequency_penalty", "presence_penalty"];

pub struct ReasoningAdjustCodec;

impl Codec for ReasoningAdjustCodec {
    fn name(&self) -> &'static str {
        "reasoning-adjust"
    }

    fn encode_request(
        &self,
        request: &CanonicalRequest,
        mut wire: WireRequest,
    ) -> Result<WireRequest, CodecError> {
        let caps = capabilities_for(&request.model);
        if !caps.requires_reasoning_effort {
            return Ok(wire);
        }
        let body = wire.body_object();
        for key in SAMPLING_KEYS {
            if body.remove(*key).is_some() {
                log::debug!("'{}' removed for reasoning model '{}'", key, request.model);
            }
        }
        body.entry("reasoning_effort")
            .or_insert_with(|| DEFAULT_REASONING_EFFORT.into());
        Ok(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Message;
    use crate::codecs::OpenAICodec;
    use crate::codecs::CodecChain;
    use std::sync::Arc;

    #[test]
    fn test_reasoning_models_get_effort_and_lose_sampling() {
        let chain = CodecChain::new(vec![Arc::new(OpenAICodec), Arc::new(ReasoningAdjustCodec)]);
        let mut request = CanonicalRequest::new("o3-mini", vec![Message::user("hi")]);
        request.temperature = Some(0.9);
        let body = chain.encode(&request).unwrap().body;
        assert_eq!(body["reasoning_effort"], DEFAULT_REASONING_EFFORT);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_identity_for_non_reasoning_families() {
        let chain = CodecChain::new(vec![Arc::new(OpenAICodec), Arc::new(ReasoningAdjustCodec)]);
        let mut request = CanonicalRequest::new("gpt-4o", vec![Message::user("hi")]);
        request.temperature = Some(0.5);
        let body = chain.encode(&request).unwrap().body;
        assert!(body.get("reasoning_effort").is_none());
        assert_eq!(body["temperature"], 0.5);
    }

    #[test]
    fn test_explicit_effort_is_not_overwritten() {
        let request = CanonicalRequest::new("o3-mini", vec![Message::user("hi")]);
        let mut wire = WireRequest::default();
        wire.body_object()
            .insert("reasoning_effort".to_string(), "high".into());
        let wire = ReasoningAdjustCodec.encode_request(&request, wire).unwrap();
        assert_eq!(wire.body["reasoning_effort"], "high");
    }
}
