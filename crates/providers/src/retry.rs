//! Retryable-error classification.
//!
//! Adapters surface failures without retrying; the turn loop consults
//! [`is_retryable`] to decide whether a bounded backoff retry is worth
//! attempting.

use sk_domain::error::Error;

/// Substrings that mark a transient network/server failure.
const RETRYABLE_PATTERNS: &[&str] = &[
    "connection",
    "timeout",
    "timed out",
    "rate limit",
    "rate_limit",
    "429",
    "500",
    "502",
    "503",
    "504",
    "overloaded",
    "service unavailable",
    "service_unavailable",
    "server error",
    "internal error",
    "incomplete chunked read",
    "peer closed",
    "reset by peer",
    "broken pipe",
    "fetch failed",
];

/// Check whether an LLM error is transient and worth retrying.
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Timeout(_) => true,
        _ => {
            let text = error.to_string().to_lowercase();
            RETRYABLE_PATTERNS.iter().any(|p| text.contains(p))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_variant_is_retryable() {
        assert!(is_retryable(&Error::Timeout("deadline exceeded".into())));
    }

    #[test]
    fn http_429_is_retryable() {
        let err = Error::Provider {
            provider: "anthropic".into(),
            message: "HTTP 429 - rate limited".into(),
        };
        assert!(is_retryable(&err));
    }

    #[test]
    fn overloaded_is_retryable() {
        let err = Error::Provider {
            provider: "anthropic".into(),
            message: "Overloaded".into(),
        };
        assert!(is_retryable(&err));
    }

    #[test]
    fn connection_reset_is_retryable() {
        assert!(is_retryable(&Error::Http("connection reset by peer".into())));
    }

    #[test]
    fn auth_failure_is_not_retryable() {
        assert!(!is_retryable(&Error::Auth("invalid api key".into())));
    }

    #[test]
    fn http_400_is_not_retryable() {
        let err = Error::Provider {
            provider: "openai".into(),
            message: "HTTP 400 - bad request".into(),
        };
        assert!(!is_retryable(&err));
    }
}
