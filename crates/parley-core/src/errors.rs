use std::time::Duration;

/// Failure raised by a provider while opening or reading its response stream.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Short classification string for logging/metrics labels.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code returned by a backend.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            ProviderError::from_status(401, "nope".into()),
            ProviderError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, String::new()),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(502, "bad gateway".into()),
            ProviderError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(418, "teapot".into()),
            ProviderError::InvalidRequest(msg) if msg.contains("418")
        ));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ProviderError::Timeout(Duration::from_secs(1)).error_kind(), "timeout");
        assert_eq!(
            ProviderError::StreamInterrupted("eof".into()).error_kind(),
            "stream_interrupted"
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = ProviderError::ServerError { status: 500, body: "boom".into() };
        assert_eq!(err.to_string(), "server error 500: boom");
    }
}
