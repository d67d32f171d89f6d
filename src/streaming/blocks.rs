//! Content-block state machine for streamed responses.
//!
//! Codecs translate wire frames into [`StreamSignal`]s; this machine assigns
//! canonical block indices, tracks open blocks and tool-call argument
//! accumulation, and emits [`CanonicalStreamEvent`]s. It is per-response
//! state and is not safe for concurrent mutation.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use serde_json::Value;

use crate::canonical::{
    BlockKind, CanonicalStreamEvent, Delta, FinishReason, Usage, REFUSAL_PREFIX,
};
use crate::policy::finish::FinishPolicy;

/// Provider-decoded signal, one step removed from the wire.
///
/// `key` is the provider's own block identifier (an index for Anthropic, a
/// tool-call slot for OpenAI, an output index for Responses); the machine
/// maps keys to canonical indices, which are assigned monotonically and
/// never reused.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    MessageStart {
        id: String,
        model: String,
    },
    BlockAdded {
        key: u32,
        kind: BlockKind,
    },
    TextDelta {
        key: u32,
        text: String,
    },
    /// Text of an upstream safety refusal. Surfaced as an ordinary text
    /// block whose first delta carries the refusal marker, so streamed and
    /// buffered clients see the same content.
    RefusalDelta {
        key: u32,
        text: String,
    },
    ThinkingDelta {
        key: u32,
        text: String,
    },
    SignatureDelta {
        key: u32,
        signature: String,
    },
    /// Raw tool-argument increment; concatenated verbatim, parsed at close.
    ArgumentsDelta {
        key: u32,
        partial_json: String,
    },
    BlockDone {
        key: u32,
    },
    /// Upstream reported a finish reason; recorded for the terminal
    /// `MessageDelta` (some providers send it chunks before the stream ends).
    FinishReported {
        reason: FinishReason,
    },
    /// Usage counts, likewise recorded (often a separate trailing chunk).
    UsageReported {
        usage: Usage,
    },
    Completed {
        reported: Option<FinishReason>,
        usage: Option<Usage>,
    },
    /// Frame understood but carrying nothing for the canonical stream.
    Ignore,
}

#[derive(Debug)]
struct ToolCallEntry {
    partial_arguments: String,
}

/// Transient per-stream map of block index to partially accumulated
/// tool-call arguments. Destroyed with the machine when the stream ends.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    entries: HashMap<u32, ToolCallEntry>,
}

impl ToolCallAccumulator {
    fn open(&mut self, index: u32) {
        self.entries.insert(
            index,
            ToolCallEntry {
                partial_arguments: String::new(),
            },
        );
    }

    fn append(&mut self, index: u32, increment: &str) {
        if let Some(entry) = self.entries.get_mut(&index) {
            entry.partial_arguments.push_str(increment);
        }
    }

    /// Close an entry, parsing the accumulated arguments. `Err` carries the
    /// raw string for diagnostics; the block is still closed.
    fn close(&mut self, index: u32) -> Option<Result<Value, String>> {
        let entry = self.entries.remove(&index)?;
        let raw = entry.partial_arguments;
        if raw.is_empty() {
            // Zero-argument tool calls are legal; treat as `{}`.
            return Some(Ok(Value::Object(Default::default())));
        }
        Some(serde_json::from_str(&raw).map_err(|_| raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MachineState {
    Idle,
    MessageOpen,
    MessageClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlockKind {
    Text,
    Thinking,
    ToolUse,
}

pub struct BlockStateMachine {
    state: MachineState,
    next_index: u32,
    key_to_index: HashMap<u32, u32>,
    open_blocks: BTreeMap<u32, OpenBlockKind>,
    accumulator: ToolCallAccumulator,
    policy: FinishPolicy,
    saw_tool_call: bool,
    saw_refusal: bool,
    refusal_marked: HashSet<u32>,
    pending_reported: Option<FinishReason>,
    pending_usage: Option<Usage>,
    malformed_blocks: Vec<u32>,
    response_id: String,
    model: String,
}

impl BlockStateMachine {
    /// `model` labels synthesized `MessageStart` events for providers that
    /// never announce one; an explicit start overrides it.
    pub fn new(policy: FinishPolicy, model: impl Into<String>) -> Self {
        BlockStateMachine {
            state: MachineState::Idle,
            next_index: 0,
            key_to_index: HashMap::new(),
            open_blocks: BTreeMap::new(),
            accumulator: ToolCallAccumulator::default(),
            policy,
            saw_tool_call: false,
            saw_refusal: false,
            refusal_marked: HashSet::new(),
            pending_reported: None,
            pending_usage: None,
            malformed_blocks: Vec::new(),
            response_id: String::new(),
            model: model.into(),
        }
    }

    /// Block indices whose tool-call arguments failed to parse at close.
    /// Their `BlockStop` events were still emitted; an agent loop downstream
    /// can inspect and retry.
    pub fn malformed_blocks(&self) -> &[u32] {
        &self.malformed_blocks
    }

    pub fn is_closed(&self) -> bool {
        self.state == MachineState::MessageClosed
    }

    /// Advance the machine with one decoded signal.
    pub fn on_signal(&mut self, signal: StreamSignal) -> Vec<CanonicalStreamEvent> {
        if self.state == MachineState::MessageClosed {
            return Vec::new();
        }
        let mut out = Vec::new();
        match signal {
            StreamSignal::MessageStart { id, model } => {
                if self.state == MachineState::Idle {
                    self.response_id = id.clone();
                    self.model = model.clone();
                    self.state = MachineState::MessageOpen;
                    out.push(CanonicalStreamEvent::MessageStart { id, model });
                }
            }
            StreamSignal::BlockAdded { key, kind } => {
                self.ensure_message_open(&mut out);
                self.open_block(key, kind, &mut out);
            }
            StreamSignal::TextDelta { key, text } => {
                self.ensure_message_open(&mut out);
                let index = self.ensure_block(key, OpenBlockKind::Text, &mut out);
                out.push(CanonicalStreamEvent::BlockDelta {
                    index,
                    delta: Delta::Text { text },
                });
            }
            StreamSignal::RefusalDelta { key, text } => {
                self.ensure_message_open(&mut out);
                let index = self.ensure_block(key, OpenBlockKind::Text, &mut out);
                self.saw_refusal = true;
                // First refusal delta per block carries the marker, whether
                // or not the provider announced the block beforehand.
                let text = if self.refusal_marked.insert(index) {
                    format!("{}{}", REFUSAL_PREFIX, text)
                } else {
                    text
                };
                out.push(CanonicalStreamEvent::BlockDelta {
                    index,
                    delta: Delta::Text { text },
                });
            }
            StreamSignal::ThinkingDelta { key, text } => {
                self.ensure_message_open(&mut out);
                let index = self.ensure_block(key, OpenBlockKind::Thinking, &mut out);
                out.push(CanonicalStreamEvent::BlockDelta {
                    index,
                    delta: Delta::Thinking { text },
                });
            }
            StreamSignal::SignatureDelta { key, signature } => {
                self.ensure_message_open(&mut out);
                let index = self.ensure_block(key, OpenBlockKind::Thinking, &mut out);
                out.push(CanonicalStreamEvent::BlockDelta {
                    index,
                    delta: Delta::Signature { signature },
                });
            }
            StreamSignal::ArgumentsDelta { key, partial_json } => {
                self.ensure_message_open(&mut out);
                let index = self.ensure_block(key, OpenBlockKind::ToolUse, &mut out);
                self.accumulator.append(index, &partial_json);
                out.push(CanonicalStreamEvent::BlockDelta {
                    index,
                    delta: Delta::ToolArguments { partial_json },
                });
            }
            StreamSignal::BlockDone { key } => {
                if let Some(index) = self.key_to_index.get(&key).copied() {
                    self.close_block(index, &mut out);
                }
            }
            StreamSignal::FinishReported { reason } => {
                self.pending_reported = Some(reason);
            }
            StreamSignal::UsageReported { usage } => {
                self.pending_usage = Some(merge_usage(self.pending_usage.take(), usage));
            }
            StreamSignal::Completed { reported, usage } => {
                self.ensure_message_open(&mut out);
                self.close_all_open_blocks(&mut out);
                // A refusal forces its finish reason, as the buffered
                // decoders do.
                let reported = if self.saw_refusal {
                    Some(FinishReason::Refusal)
                } else {
                    reported.or(self.pending_reported)
                };
                let usage = match usage {
                    Some(usage) => Some(merge_usage(self.pending_usage.take(), usage)),
                    None => self.pending_usage.take(),
                };
                let finish_reason = self.policy.decide(reported, self.saw_tool_call);
                out.push(CanonicalStreamEvent::MessageDelta {
                    finish_reason: Some(finish_reason),
                    usage,
                });
                out.push(CanonicalStreamEvent::MessageStop);
                self.state = MachineState::MessageClosed;
            }
            StreamSignal::Ignore => {}
        }
        out
    }

    /// Terminate on upstream failure: every open block gets its `BlockStop`
    /// before the terminal error event, so clients never see an
    /// unterminated block.
    pub fn abort(&mut self, message: &str) -> Vec<CanonicalStreamEvent> {
        if self.state == MachineState::MessageClosed {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.close_all_open_blocks(&mut out);
        out.push(CanonicalStreamEvent::Error {
            kind: "stream_aborted".to_string(),
            message: message.to_string(),
        });
        out.push(CanonicalStreamEvent::MessageStop);
        self.state = MachineState::MessageClosed;
        out
    }

    /// End of input without an explicit completion signal: close out
    /// defensively rather than leaving the message open.
    pub fn finish(&mut self) -> Vec<CanonicalStreamEvent> {
        if self.state != MachineState::MessageOpen {
            return Vec::new();
        }
        self.on_signal(StreamSignal::Completed {
            reported: None,
            usage: None,
        })
    }

    fn ensure_message_open(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if self.state == MachineState::Idle {
            let id = format!("resp_{}", uuid::Uuid::new_v4().simple());
            self.response_id = id.clone();
            self.state = MachineState::MessageOpen;
            out.push(CanonicalStreamEvent::MessageStart {
                id,
                model: self.model.clone(),
            });
        }
    }

    fn open_block(&mut self, key: u32, kind: BlockKind, out: &mut Vec<CanonicalStreamEvent>) {
        if self.key_to_index.contains_key(&key) {
            log::debug!("duplicate block-added signal for key {}", key);
            return;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.key_to_index.insert(key, index);
        let open_kind = match &kind {
            BlockKind::Text => OpenBlockKind::Text,
            BlockKind::Thinking => OpenBlockKind::Thinking,
            BlockKind::ToolUse { .. } => {
                self.saw_tool_call = true;
                self.accumulator.open(index);
                OpenBlockKind::ToolUse
            }
        };
        self.open_blocks.insert(index, open_kind);
        out.push(CanonicalStreamEvent::BlockStart { index, kind });
    }

    /// Look up the canonical index for a provider key, synthesizing a
    /// `BlockStart` when a delta arrives for a block the provider never
    /// announced (OpenAI text deltas have no explicit added signal).
    fn ensure_block(
        &mut self,
        key: u32,
        kind: OpenBlockKind,
        out: &mut Vec<CanonicalStreamEvent>,
    ) -> u32 {
        if let Some(index) = self.key_to_index.get(&key) {
            return *index;
        }
        let block_kind = match kind {
            OpenBlockKind::Text => BlockKind::Text,
            OpenBlockKind::Thinking => BlockKind::Thinking,
            OpenBlockKind::ToolUse => BlockKind::ToolUse {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: String::new(),
            },
        };
        self.open_block(key, block_kind, out);
        self.key_to_index[&key]
    }

    fn close_block(&mut self, index: u32, out: &mut Vec<CanonicalStreamEvent>) {
        if self.open_blocks.remove(&index).is_none() {
            return;
        }
        // A provider key addresses an open block only; releasing it lets
        // providers that number blocks per frame open fresh ones later.
        // Canonical indices are never reused either way.
        self.key_to_index.retain(|_, mapped| *mapped != index);
        if let Some(Err(raw)) = self.accumulator.close(index) {
            log::warn!(
                "tool call at block {} closed with unparseable arguments ({} bytes)",
                index,
                raw.len()
            );
            self.malformed_blocks.push(index);
        }
        out.push(CanonicalStreamEvent::BlockStop { index });
    }

    fn close_all_open_blocks(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        let open: Vec<u32> = self.open_blocks.keys().copied().collect();
        for index in open {
            self.close_block(index, out);
        }
    }
}

/// Providers split usage across frames (Anthropic reports input tokens at
/// `message_start` and output tokens at `message_delta`); merge field-wise
/// so a later partial report never zeroes an earlier count.
fn merge_usage(earlier: Option<Usage>, later: Usage) -> Usage {
    let Some(earlier) = earlier else {
        return later;
    };
    Usage {
        input_tokens: if later.input_tokens != 0 {
            later.input_tokens
        } else {
            earlier.input_tokens
        },
        output_tokens: if later.output_tokens != 0 {
            later.output_tokens
        } else {
            earlier.output_tokens
        },
        reasoning_tokens: later.reasoning_tokens.or(earlier.reasoning_tokens),
    }
}
