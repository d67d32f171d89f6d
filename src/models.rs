//! Per-model capability table and token budget calculation.
//!
//! The table is static and keyed by model-name prefix (longest match wins).
//! It is fully initialized at compile time and only ever read, so concurrent
//! unsynchronized access is safe.

/// The provider parameter that carries the output token limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenParam {
    MaxTokens,
    MaxCompletionTokens,
    MaxOutputTokens,
}

impl TokenParam {
    pub fn wire_name(&self) -> &'static str {
        match self {
            TokenParam::MaxTokens => "max_tokens",
            TokenParam::MaxCompletionTokens => "max_completion_tokens",
            TokenParam::MaxOutputTokens => "max_output_tokens",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingParam {
    Temperature,
    TopP,
    FrequencyPenalty,
    PresencePenalty,
}

#[derive(Debug, Clone)]
pub struct ModelCapabilities {
    pub prefix: &'static str,
    pub token_param: TokenParam,
    pub min_tokens: u32,
    pub max_tokens: u32,
    /// Used when the request carries no limit at all.
    pub default_tokens: u32,
    pub supports_json_schema: bool,
    pub supports_prediction: bool,
    pub supports_tools: bool,
    pub requires_reasoning_effort: bool,
    /// Reasoning-capable models burn hidden deliberation tokens out of the
    /// same budget, so they get a fixed overhead in `compute_limit`.
    pub reasoning: bool,
    pub unsupported_sampling: &'static [SamplingParam],
}

const NO_SAMPLING_RESTRICTIONS: &[SamplingParam] = &[];
const REASONING_SAMPLING_RESTRICTIONS: &[SamplingParam] = &[
    SamplingParam::Temperature,
    SamplingParam::TopP,
    SamplingParam::FrequencyPenalty,
    SamplingParam::PresencePenalty,
];

static CAPABILITY_TABLE: &[ModelCapabilities] = &[
    ModelCapabilities {
        prefix: "gpt-4o",
        token_param: TokenParam::MaxCompletionTokens,
        min_tokens: 1,
        max_tokens: 16_384,
        default_tokens: 4_096,
        supports_json_schema: true,
        supports_prediction: true,
        supports_tools: true,
        requires_reasoning_effort: false,
        reasoning: false,
        unsupported_sampling: NO_SAMPLING_RESTRICTIONS,
    },
    ModelCapabilities {
        prefix: "gpt-4.1",
        token_param: TokenParam::MaxCompletionTokens,
        min_tokens: 1,
        max_tokens: 32_768,
        default_tokens: 4_096,
        supports_json_schema: true,
        supports_prediction: true,
        supports_tools: true,
        requires_reasoning_effort: false,
        reasoning: false,
        unsupported_sampling: NO_SAMPLING_RESTRICTIONS,
    },
    ModelCapabilities {
        prefix: "gpt-5",
        token_param: TokenParam::MaxOutputTokens,
        min_tokens: 16,
        max_tokens: 128_000,
        default_tokens: 8_192,
        supports_json_schema: true,
        supports_prediction: false,
        supports_tools: true,
        requires_reasoning_effort: true,
        reasoning: true,
        unsupported_sampling: REASONING_SAMPLING_RESTRICTIONS,
    },
    ModelCapabilities {
        prefix: "o1",
        token_param: TokenParam::MaxCompletionTokens,
        min_tokens: 16,
        max_tokens: 100_000,
        default_tokens: 8_192,
        supports_json_schema: true,
        supports_prediction: false,
        supports_tools: false,
        requires_reasoning_effort: true,
        reasoning: true,
        unsupported_sampling: REASONING_SAMPLING_RESTRICTIONS,
    },
    ModelCapabilities {
        prefix: "o3",
        token_param: TokenParam::MaxCompletionTokens,
        min_tokens: 16,
        max_tokens: 100_000,
        default_tokens: 8_192,
        supports_json_schema: true,
        supports_prediction: false,
        supports_tools: true,
        requires_reasoning_effort: true,
        reasoning: true,
        unsupported_sampling: REASONING_SAMPLING_RESTRICTIONS,
    },
    ModelCapabilities {
        prefix: "o4-mini",
        token_param: TokenParam::MaxCompletionTokens,
        min_tokens: 16,
        max_tokens: 100_000,
        default_tokens: 8_192,
        supports_json_schema: true,
        supports_prediction: false,
        supports_tools: true,
        requires_reasoning_effort: true,
        reasoning: true,
        unsupported_sampling: REASONING_SAMPLING_RESTRICTIONS,
    },
    ModelCapabilities {
        prefix: "claude-",
        token_param: TokenParam::MaxTokens,
        min_tokens: 1,
        max_tokens: 64_000,
        default_tokens: 4_096,
        supports_json_schema: false,
        supports_prediction: false,
        supports_tools: true,
        requires_reasoning_effort: false,
        reasoning: true,
        unsupported_sampling: &[SamplingParam::FrequencyPenalty, SamplingParam::PresencePenalty],
    },
    ModelCapabilities {
        prefix: "gemini-",
        token_param: TokenParam::MaxOutputTokens,
        min_tokens: 1,
        max_tokens: 65_536,
        default_tokens: 8_192,
        supports_json_schema: true,
        supports_prediction: false,
        supports_tools: true,
        requires_reasoning_effort: false,
        reasoning: false,
        unsupported_sampling: &[SamplingParam::FrequencyPenalty, SamplingParam::PresencePenalty],
    },
];

static FALLBACK_CAPABILITIES: ModelCapabilities = ModelCapabilities {
    prefix: "",
    token_param: TokenParam::MaxTokens,
    min_tokens: 1,
    max_tokens: 16_384,
    default_tokens: 4_096,
    supports_json_schema: false,
    supports_prediction: false,
    supports_tools: true,
    requires_reasoning_effort: false,
    reasoning: false,
    unsupported_sampling: NO_SAMPLING_RESTRICTIONS,
};

/// Look up capabilities by model-name prefix, longest match winning.
pub fn capabilities_for(model: &str) -> &'static ModelCapabilities {
    CAPABILITY_TABLE
        .iter()
        .filter(|caps| model.starts_with(caps.prefix))
        .max_by_key(|caps| caps.prefix.len())
        .unwrap_or(&FALLBACK_CAPABILITIES)
}

// Overheads added on top of the requested limit; tuned against observed
// truncation on multi-tool and reasoning requests.
const TOOL_BASE_OVERHEAD: u32 = 512;
const PER_TOOL_OVERHEAD: u32 = 256;
const REASONING_OVERHEAD: u32 = 2_048;
const LONG_HISTORY_THRESHOLD: usize = 16;
const PER_MESSAGE_OVERHEAD: u32 = 16;

/// Compute the upstream output-token limit for a request.
///
/// The result is the requested limit (or the model default) raised to the
/// floor implied by tools, reasoning, and long histories, then clamped to
/// the model's `[min, max]`. Clamping is an adjustment, not an error: it is
/// logged and the call proceeds. Idempotent under re-application with the
/// same feature usage.
pub fn compute_limit(
    caps: &ModelCapabilities,
    requested: Option<u32>,
    tool_count: usize,
    message_count: usize,
) -> u32 {
    let base = requested.unwrap_or(caps.default_tokens);

    let mut floor = 0u32;
    if tool_count > 0 {
        floor += TOOL_BASE_OVERHEAD + PER_TOOL_OVERHEAD * tool_count as u32;
    }
    if caps.reasoning {
        floor += REASONING_OVERHEAD;
    }
    if message_count > LONG_HISTORY_THRESHOLD {
        floor += PER_MESSAGE_OVERHEAD * (message_count - LONG_HISTORY_THRESHOLD) as u32;
    }

    let raised = base.max(floor);
    let clamped = raised.clamp(caps.min_tokens, caps.max_tokens);
    if clamped != base {
        log::debug!(
            "token limit adjusted for '{}' family: requested={:?} floor={} -> {}",
            caps.prefix,
            requested,
            floor,
            clamped
        );
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        assert_eq!(capabilities_for("gpt-4o-2024-08-06").prefix, "gpt-4o");
        assert_eq!(capabilities_for("gpt-4.1-mini").prefix, "gpt-4.1");
        assert_eq!(capabilities_for("o4-mini-high").prefix, "o4-mini");
        assert_eq!(capabilities_for("claude-sonnet-4").prefix, "claude-");
        // Unknown models fall back to permissive defaults
        assert_eq!(capabilities_for("mistral-large").prefix, "");
    }

    #[test]
    fn test_reasoning_models_reject_sampling_params() {
        let caps = capabilities_for("o3-mini");
        assert!(caps
            .unsupported_sampling
            .contains(&SamplingParam::Temperature));
        assert!(caps.requires_reasoning_effort);
    }

    #[test]
    fn test_compute_limit_plain_request_passes_through() {
        let caps = capabilities_for("gpt-4o");
        assert_eq!(compute_limit(caps, Some(1000), 0, 2), 1000);
    }

    #[test]
    fn test_compute_limit_uses_default_when_unspecified() {
        let caps = capabilities_for("gpt-4o");
        assert_eq!(compute_limit(caps, None, 0, 2), caps.default_tokens);
    }

    #[test]
    fn test_compute_limit_clamps_to_model_max() {
        let caps = capabilities_for("gpt-4o");
        assert_eq!(compute_limit(caps, Some(9_000_000), 0, 2), caps.max_tokens);
    }

    #[test]
    fn test_tools_on_reasoning_model_raise_small_limit_to_floor() {
        // Two tool specs and a 100-token limit on a reasoning-capable model:
        // the result must be at least the tools+reasoning floor, not 100.
        let caps = capabilities_for("o3");
        let limit = compute_limit(caps, Some(100), 2, 4);
        let floor = TOOL_BASE_OVERHEAD + 2 * PER_TOOL_OVERHEAD + REASONING_OVERHEAD;
        assert!(limit >= floor);
        assert!(limit > 100);
    }

    #[test]
    fn test_compute_limit_idempotent() {
        let caps = capabilities_for("o3");
        let once = compute_limit(caps, Some(100), 2, 20);
        let twice = compute_limit(caps, Some(once), 2, 20);
        assert_eq!(once, twice);

        let caps = capabilities_for("gpt-4o");
        let once = compute_limit(caps, Some(9_000_000), 3, 2);
        let twice = compute_limit(caps, Some(once), 3, 2);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_compute_limit_within_bounds_for_all_entries() {
        for caps in CAPABILITY_TABLE {
            for requested in [None, Some(0), Some(1), Some(u32::MAX)] {
                let limit = compute_limit(caps, requested, 5, 40);
                assert!(limit >= caps.min_tokens && limit <= caps.max_tokens);
            }
        }
    }

    #[test]
    fn test_long_history_overhead_applies_past_threshold() {
        let caps = capabilities_for("gpt-4o");
        let short = compute_limit(caps, Some(1), 0, LONG_HISTORY_THRESHOLD);
        let long = compute_limit(caps, Some(1), 0, LONG_HISTORY_THRESHOLD + 10);
        assert!(long > short);
    }
}
