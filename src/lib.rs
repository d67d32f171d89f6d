//! irisllm: a protocol-translation core between one canonical
//! chat-completion representation and the wire formats of multiple LLM
//! providers, for buffered and streamed responses alike.
//!
//! The HTTP server, routing, config loading, and credential management
//! live outside this crate; callers hand the [`engine::TransformEngine`]
//! a resolved codec chain, credentials, and a canonical request.

pub mod canonical;
pub mod codecs;
pub mod engine;
pub mod error;
pub mod models;
pub mod policy;
pub mod session;
pub mod streaming;

// Re-export the surface most callers touch.
pub use canonical::{
    CanonicalRequest, CanonicalResponse, CanonicalStreamEvent, ContentBlock, FinishReason,
    Message, ResponseFormat, Role, ToolSpec, Usage,
};
pub use codecs::{Codec, CodecChain, CodecRegistry, WireRequest};
pub use engine::{CanonicalStream, StreamingResponse, TransformEngine, Transport, TransportResponse};
pub use error::{CodecError, GatewayError, StreamError};
pub use policy::{FinishPolicy, ToolCallBehavior};
pub use session::{ConversationState, InMemorySessionStore, SessionStore};
