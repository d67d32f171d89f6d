//! Streamed-response handling: SSE reassembly and the content-block
//! state machine that turns decoded signals into canonical events.

pub mod blocks;
pub mod sse;

pub use blocks::{BlockStateMachine, StreamSignal};
pub use sse::{SseFrame, SseReassembler};
