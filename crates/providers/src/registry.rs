//! Provider construction by name.

use std::sync::Arc;

use sk_domain::error::{Error, Result};

use crate::anthropic::AnthropicClient;
use crate::google::GoogleClient;
use crate::openai_compat::OpenAiCompatClient;
use crate::traits::LlmClient;

/// Default model per provider, used when the caller leaves it unset.
pub fn default_model(provider: &str) -> &'static str {
    match provider {
        "anthropic" => "claude-sonnet-4-20250514",
        "openai" => "gpt-4o",
        "openrouter" => "anthropic/claude-sonnet-4",
        "google" => "gemini-2.0-flash",
        _ => "claude-sonnet-4-20250514",
    }
}

/// Build an LLM client for a provider/model pair.
///
/// `api_key` overrides the provider's environment variable when set.
pub fn build_client(
    provider: &str,
    model: Option<&str>,
    api_key: Option<&str>,
) -> Result<Arc<dyn LlmClient>> {
    let model = model.unwrap_or_else(|| default_model(provider));
    let client: Arc<dyn LlmClient> = match provider {
        "anthropic" => Arc::new(AnthropicClient::new(model, api_key)?),
        "openai" => Arc::new(OpenAiCompatClient::openai(model, api_key)?),
        "openrouter" => Arc::new(OpenAiCompatClient::openrouter(model, api_key)?),
        "google" => Arc::new(GoogleClient::new(model, api_key)?),
        other => {
            return Err(Error::Config(format!(
                "unknown model provider '{other}' (expected anthropic, openai, openrouter, or google)"
            )));
        }
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_a_config_error() {
        let err = build_client("mystery", None, Some("key")).unwrap_err();
        assert!(err.to_string().contains("unknown model provider"));
    }

    #[test]
    fn builds_each_known_provider() {
        for provider in ["anthropic", "openai", "openrouter", "google"] {
            let client = build_client(provider, None, Some("test-key")).unwrap();
            assert_eq!(client.provider_id(), provider);
            assert!(!client.model().is_empty());
            assert!(client.context_limit() > 0);
        }
    }
}
