//! Finish-reason decision, evaluated once per completed response.

use crate::canonical::{CanonicalResponse, FinishReason};

/// How a response that contains tool calls reports its finish reason.
///
/// `ReportToolCalls` is the conventional contract: the caller sees
/// `tool_calls` and is expected to supply tool results before continuing.
/// `ContinueImmediately` reports `stop` instead, signaling an agent loop
/// that it may append tool results and keep going without waiting. Several
/// providers stall multi-step tool workflows without this, but it overloads
/// the meaning of `stop`, so it is an explicit option rather than the
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolCallBehavior {
    #[default]
    ReportToolCalls,
    ContinueImmediately,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FinishPolicy {
    pub tool_calls: ToolCallBehavior,
}

impl FinishPolicy {
    /// Decide the reported finish reason, in priority order:
    /// truncation always wins, then tool calls per the configured behavior,
    /// then whatever the upstream reported, then `stop`.
    pub fn decide(&self, reported: Option<FinishReason>, has_tool_calls: bool) -> FinishReason {
        if reported == Some(FinishReason::Length) {
            return FinishReason::Length;
        }
        if has_tool_calls {
            return match self.tool_calls {
                ToolCallBehavior::ReportToolCalls => FinishReason::ToolCalls,
                ToolCallBehavior::ContinueImmediately => FinishReason::Stop,
            };
        }
        reported.unwrap_or(FinishReason::Stop)
    }

    /// Re-evaluate a decoded (non-streamed) response against this policy.
    pub fn apply(&self, mut response: CanonicalResponse) -> CanonicalResponse {
        response.finish_reason =
            self.decide(Some(response.finish_reason), response.has_tool_calls());
        response
    }
}
