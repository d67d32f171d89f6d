//! Best-effort detection of responses that stopped mid-thought.
//!
//! This is a heuristic, not a contract: it inspects the tail of the
//! assistant text for markers that the model intended to keep going.
//! Callers that want automatic continuation rounds opt in explicitly;
//! nothing in the decode path consults this module.

use crate::canonical::{CanonicalResponse, ExtractText, FinishReason};

/// Phrases that, at the end of a response, usually announce work the
/// model never got to.
const FUTURE_INTENT_MARKERS: &[&str] = &[
    "i will now",
    "i'll now",
    "let me",
    "next, i will",
    "next, i'll",
    "now i will",
    "proceeding to",
];

/// Whether `response` looks cut off and is worth a continuation round.
///
/// Length-limited responses always qualify. Responses that ended with
/// `stop` qualify only when the text tail carries a truncation marker:
/// a trailing comma or colon, an ellipsis, a dangling enumeration item,
/// or a first-person statement of future intent.
pub fn should_continue(response: &CanonicalResponse) -> bool {
    match response.finish_reason {
        FinishReason::Length => true,
        FinishReason::Stop => looks_truncated(&response.content.extract_text()),
        _ => false,
    }
}

fn looks_truncated(text: &str) -> bool {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.ends_with(',') || trimmed.ends_with(':') || trimmed.ends_with("...") {
        return true;
    }
    if let Some(last_line) = trimmed.lines().last() {
        if is_dangling_enumeration(last_line.trim()) {
            return true;
        }
    }
    let tail = last_sentence(trimmed).to_lowercase();
    FUTURE_INTENT_MARKERS
        .iter()
        .any(|marker| tail.contains(marker))
}

/// `"3."` or `"2)"` or a bare bullet with nothing after it.
fn is_dangling_enumeration(line: &str) -> bool {
    if line == "-" || line == "*" {
        return true;
    }
    let Some(rest) = line.strip_suffix('.').or_else(|| line.strip_suffix(')')) else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

fn last_sentence(text: &str) -> &str {
    match text.rfind(['.', '!', '?', '\n']) {
        Some(pos) if pos + 1 < text.len() => &text[pos + 1..],
        // No earlier boundary, the whole text is one sentence.
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{ContentBlock, Usage};

    fn response(text: &str, finish: FinishReason) -> CanonicalResponse {
        CanonicalResponse {
            id: "resp_1".to_string(),
            model: "gpt-4o".to_string(),
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            finish_reason: finish,
            usage: Usage::default(),
            reasoning_summary: None,
        }
    }

    #[test]
    fn test_length_limited_always_continues() {
        assert!(should_continue(&response("anything", FinishReason::Length)));
    }

    #[test]
    fn test_complete_answer_does_not_continue() {
        assert!(!should_continue(&response(
            "The capital of France is Paris.",
            FinishReason::Stop
        )));
    }

    #[test]
    fn test_trailing_comma_and_ellipsis_continue() {
        assert!(should_continue(&response(
            "First we parse the file,",
            FinishReason::Stop
        )));
        assert!(should_continue(&response(
            "And then...",
            FinishReason::Stop
        )));
    }

    #[test]
    fn test_dangling_enumeration_continues() {
        assert!(should_continue(&response(
            "Steps:\n1. Parse\n2. Validate\n3.",
            FinishReason::Stop
        )));
    }

    #[test]
    fn test_future_intent_continues() {
        assert!(should_continue(&response(
            "The schema checks out. I will now write the migration",
            FinishReason::Stop
        )));
    }

    #[test]
    fn test_tool_call_finish_never_continues() {
        assert!(!should_continue(&response(
            "calling a tool,",
            FinishReason::ToolCalls
        )));
    }
}
