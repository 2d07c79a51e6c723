//! Provider error taxonomy
//!
//! Transient failures (network, rate-limit, 5xx) feed the retry and
//! fallback-chain machinery; everything else short-circuits.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("failed to parse provider response: {0}")]
    Parse(String),

    #[error("provider configuration error: {0}")]
    Configuration(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Whether the fallback chain / retry policy should try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::Timeout | LlmError::RateLimited { .. } => true,
            LlmError::Api { status, .. } => matches!(status, 408 | 429) || *status >= 500,
            _ => false,
        }
    }

    /// Classify a non-success HTTP status with its body.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => LlmError::Auth(message),
            400 | 404 | 422 => LlmError::BadRequest(message),
            429 => LlmError::RateLimited { retry_after: None },
            _ => LlmError::Api { status, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::RateLimited { retry_after: None }.is_retryable());
        assert!(LlmError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!LlmError::Auth("bad key".to_string()).is_retryable());
        assert!(!LlmError::BadRequest("schema".to_string()).is_retryable());
        assert!(!LlmError::Parse("eof".to_string()).is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            LlmError::from_status(401, String::new()),
            LlmError::Auth(_)
        ));
        assert!(matches!(
            LlmError::from_status(400, String::new()),
            LlmError::BadRequest(_)
        ));
        assert!(matches!(
            LlmError::from_status(429, String::new()),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            LlmError::from_status(502, String::new()),
            LlmError::Api { status: 502, .. }
        ));
    }
}
