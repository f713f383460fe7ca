use std::time::Duration;

/// Failures raised by the conversation engine during completion.
///
/// This layer never retries; `is_retryable` is informational for callers
/// that own a retry policy.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
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
    #[error("cancelled")]
    Cancelled,
    /// A turn observer refused to continue; the observer keeps the cause.
    #[error("aborted by turn observer: {0}")]
    Aborted(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// Conversion failure for a single attachment source.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("attachment io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported attachment source: {0}")]
    UnsupportedSource(String),
    #[error("attachment {filename} exceeds {limit} bytes")]
    TooLarge { filename: String, limit: u64 },
    #[error("blob store: {0}")]
    Blob(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::RateLimited { retry_after: None }.is_retryable());
        assert!(EngineError::ServerError { status: 502, body: "bad gateway".into() }.is_retryable());
        assert!(EngineError::NetworkError("reset".into()).is_retryable());
        assert!(!EngineError::AuthenticationFailed("bad key".into()).is_retryable());
        assert!(!EngineError::Aborted("store".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(EngineError::Cancelled.error_kind(), "cancelled");
        assert_eq!(EngineError::Timeout(Duration::from_secs(1)).error_kind(), "timeout");
    }

    #[test]
    fn too_large_display() {
        let err = AttachmentError::TooLarge { filename: "big.bin".into(), limit: 10 };
        assert_eq!(err.to_string(), "attachment big.bin exceeds 10 bytes");
    }
}
