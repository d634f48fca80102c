/// Failures reported by an AI provider. No variant is retried internally;
/// `is_retryable` is a hint for callers that impose their own policy.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("missing API key for {0}")]
    MissingApiKey(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited")]
    RateLimited,
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    ProviderOverloaded,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ServerError { .. }
                | Self::ProviderOverloaded
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
        )
    }

    /// Short classification string for logs and `error` frames.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnsupportedProvider(_) => "unsupported_provider",
            Self::MissingApiKey(_) => "missing_api_key",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited,
            529 => Self::ProviderOverloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(ProviderError::NetworkError("tcp".into()).is_retryable());
        assert!(!ProviderError::AuthenticationFailed("bad key".into()).is_retryable());
        assert!(!ProviderError::UnsupportedProvider("gemini".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            ProviderError::from_status(401, "unauthorized".into()),
            ProviderError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            ProviderError::from_status(400, "bad request".into()),
            ProviderError::InvalidRequest(_)
        ));
        assert!(matches!(ProviderError::from_status(429, String::new()), ProviderError::RateLimited));
        assert!(matches!(
            ProviderError::from_status(529, String::new()),
            ProviderError::ProviderOverloaded
        ));
        assert!(matches!(
            ProviderError::from_status(502, "bad gateway".into()),
            ProviderError::ServerError { status: 502, .. }
        ));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ProviderError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            ProviderError::UnsupportedProvider("x".into()).error_kind(),
            "unsupported_provider"
        );
        assert_eq!(ProviderError::RateLimited.error_kind(), "rate_limited");
    }

    #[test]
    fn messages_are_descriptive() {
        let err = ProviderError::UnsupportedProvider("gemini".into());
        assert_eq!(err.to_string(), "unsupported provider: gemini");
    }
}
