//! The transformation engine: validates a canonical request, runs it
//! through a codec chain over an injected transport, and hands back a
//! canonical response or a canonical event stream.
//!
//! The engine is synchronous and holds no per-request state; everything
//! a stream needs lives in the [`CanonicalStream`] it returns.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::canonical::{
    CanonicalRequest, CanonicalResponse, CanonicalStreamEvent, ContentBlock,
};
use crate::codecs::{CodecChain, WireRequest};
use crate::error::{GatewayError, StreamError};
use crate::models::capabilities_for;
use crate::policy::finish::FinishPolicy;
use crate::session::{ConversationState, SessionStore};
use crate::streaming::{BlockStateMachine, SseReassembler};

/// Byte chunks as the transport produces them; boundaries are arbitrary.
pub type ByteChunks = Box<dyn Iterator<Item = Result<Vec<u8>, GatewayError>> + Send>;

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

pub struct StreamingResponse {
    pub status: u16,
    pub chunks: ByteChunks,
}

/// The I/O seam. Implementations own connections, timeouts, and retries;
/// the engine treats any failure here as a transport error.
pub trait Transport: Send + Sync {
    fn send(&self, wire: &WireRequest) -> Result<TransportResponse, GatewayError>;
    fn send_stream(&self, wire: &WireRequest) -> Result<StreamingResponse, GatewayError>;
}

pub struct TransformEngine {
    transport: Arc<dyn Transport>,
    sessions: Option<Arc<dyn SessionStore>>,
    finish_policy: FinishPolicy,
}

impl TransformEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        TransformEngine {
            transport,
            sessions: None,
            finish_policy: FinishPolicy::default(),
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_finish_policy(mut self, policy: FinishPolicy) -> Self {
        self.finish_policy = policy;
        self
    }

    /// Buffered request/response round trip.
    pub fn execute(
        &self,
        chain: &CodecChain,
        api_key: &str,
        request: &CanonicalRequest,
    ) -> Result<CanonicalResponse, GatewayError> {
        let request = self.prepare(request, false)?;

        let wire = chain.encode(&request)?;
        let wire = chain.authenticate(wire, api_key);

        let upstream = self.transport.send(&wire)?;
        if !(200..300).contains(&upstream.status) {
            return Err(GatewayError::Upstream {
                status: upstream.status,
                body: String::from_utf8_lossy(&upstream.body).into_owned(),
            });
        }

        let body: Value = serde_json::from_slice(&upstream.body)
            .map_err(crate::error::CodecError::from)?;
        let response = chain.decode(&body)?;
        let response = self.finish_policy.apply(response);

        self.record_turn(&request, &response);
        Ok(response)
    }

    /// Streaming round trip. Errors after the stream is established are
    /// folded into the event stream as a terminal error event, never a
    /// mid-iteration `Err`.
    pub fn execute_stream(
        &self,
        chain: &CodecChain,
        api_key: &str,
        request: &CanonicalRequest,
    ) -> Result<CanonicalStream, GatewayError> {
        let request = self.prepare(request, true)?;

        let wire = chain.encode(&request)?;
        let wire = chain.authenticate(wire, api_key);

        let upstream = self.transport.send_stream(&wire)?;
        if !(200..300).contains(&upstream.status) {
            let body: Vec<u8> = upstream
                .chunks
                .filter_map(|chunk| chunk.ok())
                .flatten()
                .collect();
            return Err(GatewayError::Upstream {
                status: upstream.status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(CanonicalStream {
            chunks: upstream.chunks,
            reassembler: SseReassembler::new(),
            machine: BlockStateMachine::new(self.finish_policy, request.model.clone()),
            chain: chain.clone(),
            queue: VecDeque::new(),
            input_exhausted: false,
            sessions: self.sessions.clone(),
            conversation: request.conversation.clone(),
            response_id: None,
            tool_call_ids: Vec::new(),
        })
    }

    /// Validation, capability pre-flight, and session resolution.
    fn prepare(
        &self,
        request: &CanonicalRequest,
        stream: bool,
    ) -> Result<CanonicalRequest, GatewayError> {
        request.validate()?;

        let caps = capabilities_for(&request.model);
        if request.tool_count() > 0 && !caps.supports_tools {
            return Err(GatewayError::UnsupportedFeature {
                model: request.model.clone(),
                feature: "tool calling".to_string(),
            });
        }

        let mut request = request.clone();
        request.stream = stream;
        if let (Some(sessions), Some(conversation)) = (&self.sessions, &request.conversation) {
            if let Some(state) = sessions.get(conversation) {
                request.previous_response_id = state.previous_response_id;
            }
        }
        Ok(request)
    }

    fn record_turn(&self, request: &CanonicalRequest, response: &CanonicalResponse) {
        let (Some(sessions), Some(conversation)) = (&self.sessions, &request.conversation) else {
            return;
        };
        let mut state = sessions.get(conversation).unwrap_or_default();
        state.previous_response_id = Some(response.id.clone());
        for block in &response.content {
            if let ContentBlock::ToolUse { id, .. } = block {
                state.tool_history.push(id.clone());
            }
        }
        sessions.put(conversation, state);
    }
}

/// A pull-based canonical event stream.
///
/// Each transport chunk is reassembled into SSE frames, decoded by the
/// chain into signals, and run through the block state machine. Frames
/// that fail to decode are skipped with a diagnostic; a failed transport
/// chunk closes all open blocks and terminates the stream with an error
/// event followed by `MessageStop`.
pub struct CanonicalStream {
    chunks: ByteChunks,
    reassembler: SseReassembler,
    machine: BlockStateMachine,
    chain: CodecChain,
    queue: VecDeque<CanonicalStreamEvent>,
    input_exhausted: bool,
    sessions: Option<Arc<dyn SessionStore>>,
    conversation: Option<String>,
    response_id: Option<String>,
    tool_call_ids: Vec<String>,
}

impl CanonicalStream {
    /// Blocks whose tool-call arguments failed to parse; populated as the
    /// stream is consumed.
    pub fn malformed_blocks(&self) -> &[u32] {
        self.machine.malformed_blocks()
    }

    fn enqueue(&mut self, events: Vec<CanonicalStreamEvent>) {
        for event in &events {
            match event {
                CanonicalStreamEvent::MessageStart { id, .. } => {
                    self.response_id = Some(id.clone());
                }
                CanonicalStreamEvent::BlockStart {
                    kind: crate::canonical::BlockKind::ToolUse { id, .. },
                    ..
                } => {
                    self.tool_call_ids.push(id.clone());
                }
                CanonicalStreamEvent::MessageStop => self.record_turn(),
                _ => {}
            }
        }
        self.queue.extend(events);
    }

    fn process_chunk(&mut self, chunk: &[u8]) {
        let frames = self.reassembler.push_chunk(chunk);
        for frame in frames {
            if frame.is_done() {
                let events = self.machine.finish();
                self.enqueue(events);
                continue;
            }
            match self.chain.decode_frame(&frame) {
                Ok(signals) => {
                    for signal in signals {
                        let events = self.machine.on_signal(signal);
                        self.enqueue(events);
                    }
                }
                Err(err) => {
                    // Frame-local failure: skip it, keep the stream alive.
                    log::debug!("{}", StreamError::FrameDecode(err.to_string()));
                }
            }
        }
    }

    fn drain_input(&mut self) {
        if self.input_exhausted {
            return;
        }
        match self.chunks.next() {
            Some(Ok(chunk)) => self.process_chunk(&chunk),
            Some(Err(err)) => {
                self.input_exhausted = true;
                let aborted = StreamError::Aborted(err.to_string());
                log::warn!("{}", aborted);
                let events = self.machine.abort(&err.to_string());
                self.enqueue(events);
            }
            None => {
                self.input_exhausted = true;
                if let Some(frame) = self.reassembler.finish() {
                    if let Ok(signals) = self.chain.decode_frame(&frame) {
                        for signal in signals {
                            let events = self.machine.on_signal(signal);
                            self.enqueue(events);
                        }
                    }
                }
                let events = self.machine.finish();
                self.enqueue(events);
            }
        }
    }

    fn record_turn(&mut self) {
        let (Some(sessions), Some(conversation)) = (&self.sessions, &self.conversation) else {
            return;
        };
        let mut state = sessions.get(conversation).unwrap_or_default();
        state.previous_response_id = self.response_id.clone();
        state.tool_history.extend(self.tool_call_ids.drain(..));
        sessions.put(conversation, state);
    }
}

impl Iterator for CanonicalStream {
    type Item = CanonicalStreamEvent;

    fn next(&mut self) -> Option<CanonicalStreamEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if self.input_exhausted {
                return None;
            }
            self.drain_input();
        }
    }
}
