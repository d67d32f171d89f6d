//! Opt-in predicted-output detection.
//!
//! Providers that accept a prediction hint can decode edits of a known
//! document much faster. When the caller did not supply a hint, this
//! module can guess one: a request whose last user turn asks for an
//! edit, and whose history carries a sizable document, predicts that
//! document. Guessing is off unless the caller selects [`PredictionPolicy::Auto`].

use crate::canonical::{CanonicalRequest, ContentBlock, ExtractText, Role};

/// Keywords in the last user turn that signal an edit of existing content.
const EDIT_INTENT_KEYWORDS: &[&str] = &[
    "rewrite", "update", "modify", "change", "edit", "refactor", "rename", "fix",
];

/// Anything shorter is not worth predicting.
const MIN_PREDICTION_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictionPolicy {
    /// Only honor an explicitly supplied hint.
    #[default]
    Disabled,
    /// Additionally guess a hint from the conversation shape.
    Auto,
}

impl PredictionPolicy {
    /// The prediction content to send, if any. An explicit hint on the
    /// request always wins; `Auto` falls back to detection.
    pub fn resolve(&self, request: &CanonicalRequest) -> Option<String> {
        if request.prediction.is_some() {
            return request.prediction.clone();
        }
        match self {
            PredictionPolicy::Disabled => None,
            PredictionPolicy::Auto => detect_prediction(request),
        }
    }
}

/// Heuristic: last user turn states edit intent, and the largest earlier
/// text payload is big enough to be the document under edit.
pub fn detect_prediction(request: &CanonicalRequest) -> Option<String> {
    let last_user = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)?;
    let intent = last_user.content.extract_text().to_lowercase();
    if !EDIT_INTENT_KEYWORDS.iter().any(|k| intent.contains(k)) {
        return None;
    }
    request
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|block| match block {
            ContentBlock::Text { text } if text.len() >= MIN_PREDICTION_LEN => Some(text),
            _ => None,
        })
        .max_by_key(|text| text.len())
        .cloned()
}
