//! Shared utility functions for provider adapters.

use sk_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve an API key: explicit value wins, otherwise the provider's
/// environment variable.
pub fn resolve_api_key(explicit: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = explicit {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }
    std::env::var(env_var).map_err(|_| {
        Error::Auth(format!(
            "no API key configured: pass one explicitly or set the '{env_var}' environment variable"
        ))
    })
}

/// Build the shared HTTP client with the provider call timeout.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()
        .map_err(from_reqwest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_key_wins() {
        let key = resolve_api_key(Some("sk-test-123"), "SK_TEST_UNSET_VAR").unwrap();
        assert_eq!(key, "sk-test-123");
    }

    #[test]
    fn empty_explicit_key_falls_through_to_env() {
        let var = "SK_TEST_RESOLVE_KEY_4242";
        std::env::set_var(var, "env-secret");
        let key = resolve_api_key(Some(""), var).unwrap();
        assert_eq!(key, "env-secret");
        std::env::remove_var(var);
    }

    #[test]
    fn missing_key_is_an_auth_error() {
        let err = resolve_api_key(None, "SK_TEST_NONEXISTENT_VAR_9999").unwrap_err();
        assert!(err.to_string().contains("SK_TEST_NONEXISTENT_VAR_9999"));
    }
}
