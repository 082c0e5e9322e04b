//! Context-window sizes by (provider, model).
//!
//! The compressor needs the window size to compute its threshold; this
//! table covers the models we route to, with a conservative default for
//! anything unknown.

/// Default window when the model is not in the table.
pub const DEFAULT_CONTEXT_LIMIT: u64 = 200_000;

/// Longest-prefix match table. Entries are checked in order, so more
/// specific prefixes must come first.
const MODEL_CONTEXT_LIMITS: &[(&str, u64)] = &[
    // Anthropic
    ("claude-3-5-haiku", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-opus-4", 200_000),
    ("claude-3", 200_000),
    ("claude", 200_000),
    // OpenAI
    ("gpt-4.1", 1_047_576),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("o1", 200_000),
    ("o3", 200_000),
    ("gpt-4", 8_192),
    ("gpt-3.5", 16_385),
    // Google
    ("gemini-2", 1_048_576),
    ("gemini-1.5-pro", 2_097_152),
    ("gemini-1.5", 1_048_576),
    ("gemini", 1_048_576),
];

/// Look up the context window for a provider/model pair.
///
/// OpenRouter model ids are `vendor/model`; the lookup strips the vendor
/// prefix so `anthropic/claude-sonnet-4` resolves like `claude-sonnet-4`.
pub fn context_limit(provider: &str, model: &str) -> u64 {
    let bare = if provider == "openrouter" {
        model.split_once('/').map(|(_, m)| m).unwrap_or(model)
    } else {
        model
    };

    for (prefix, limit) in MODEL_CONTEXT_LIMITS {
        if bare.starts_with(prefix) {
            return *limit;
        }
    }
    DEFAULT_CONTEXT_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_models_resolve() {
        assert_eq!(context_limit("anthropic", "claude-sonnet-4-20250514"), 200_000);
        assert_eq!(context_limit("anthropic", "claude-3-5-haiku-20241022"), 200_000);
    }

    #[test]
    fn openai_prefix_order_matters() {
        // gpt-4o must not fall through to the bare gpt-4 entry.
        assert_eq!(context_limit("openai", "gpt-4o-mini"), 128_000);
        assert_eq!(context_limit("openai", "gpt-4-0613"), 8_192);
        assert_eq!(context_limit("openai", "gpt-4.1-mini"), 1_047_576);
    }

    #[test]
    fn gemini_models_resolve() {
        assert_eq!(context_limit("google", "gemini-1.5-pro-002"), 2_097_152);
        assert_eq!(context_limit("google", "gemini-2.0-flash"), 1_048_576);
    }

    #[test]
    fn openrouter_strips_vendor_prefix() {
        assert_eq!(
            context_limit("openrouter", "anthropic/claude-sonnet-4"),
            200_000
        );
        assert_eq!(context_limit("openrouter", "openai/gpt-4o"), 128_000);
    }

    #[test]
    fn unknown_model_uses_default() {
        assert_eq!(context_limit("openai", "experimental-9k"), DEFAULT_CONTEXT_LIMIT);
    }
}
