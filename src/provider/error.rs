//! Upstream provider error types and retryability classification.

use thiserror::Error;

/// Errors from a single provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider asked us to slow down.
    #[error("provider rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Server-side failure; the request itself may be fine.
    #[error("provider server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// The provider rejected the request as malformed or unauthorized.
    /// Retrying an identical request cannot succeed.
    #[error("provider rejected request (status {status}): {message}")]
    Client { status: u16, message: String },

    #[error("provider call timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Whether a retry of the identical request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Server { .. }
            | ProviderError::Timeout
            | ProviderError::Transport(_) => true,
            ProviderError::Client { .. } => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "provider_rate_limited",
            ProviderError::Server { .. } => "provider_server_error",
            ProviderError::Client { .. } => "provider_client_error",
            ProviderError::Timeout => "provider_timeout",
            ProviderError::Transport(_) => "provider_transport_error",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert!(ProviderError::RateLimited { retry_after_ms: None }.is_retryable());
        assert!(
            ProviderError::Server {
                status: 503,
                message: "overloaded".into()
            }
            .is_retryable()
        );
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(
            !ProviderError::Client {
                status: 400,
                message: "bad arguments".into()
            }
            .is_retryable()
        );
    }
}
