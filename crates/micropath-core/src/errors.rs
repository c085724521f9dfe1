use std::time::Duration;

/// Typed error hierarchy for backend operations.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    // Fatal — don't retry
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("job not found: {0}")]
    JobNotFound(String),

    // Retryable
    #[error("rate limited")]
    RateLimited,
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),

    // Operational
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("not connected")]
    NotConnected,
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("job failed: {0}")]
    JobFailed(String),
    #[error("job was canceled")]
    JobCanceled,
    #[error("job not completed yet: {0}")]
    JobNotReady(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServerError { .. } | Self::NetworkError(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::JobNotFound(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::JobNotFound(_) => "job_not_found",
            Self::RateLimited => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::ConnectFailed(_) => "connect_failed",
            Self::NotConnected => "not_connected",
            Self::Timeout(_) => "timeout",
            Self::JobFailed(_) => "job_failed",
            Self::JobCanceled => "job_canceled",
            Self::JobNotReady(_) => "job_not_ready",
            Self::Protocol(_) => "protocol",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 => Self::InvalidRequest(body),
            404 => Self::JobNotFound(body),
            429 => Self::RateLimited,
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
        assert!(ClientError::RateLimited.is_retryable());
        assert!(ClientError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(ClientError::NetworkError("tcp".into()).is_retryable());
        assert!(!ClientError::JobCanceled.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ClientError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(ClientError::InvalidRequest("bad".into()).is_fatal());
        assert!(ClientError::JobNotFound("job-1".into()).is_fatal());
        assert!(!ClientError::NotConnected.is_fatal());
    }

    #[test]
    fn operational_is_neither() {
        let timeout = ClientError::Timeout(Duration::from_secs(30));
        assert!(!timeout.is_retryable());
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(ClientError::from_status(401, "unauthorized".into()).is_fatal());
        assert!(ClientError::from_status(400, "bad request".into()).is_fatal());
        assert!(matches!(
            ClientError::from_status(404, "job-1".into()),
            ClientError::JobNotFound(_)
        ));
        assert!(ClientError::from_status(429, "slow down".into()).is_retryable());
        assert!(ClientError::from_status(502, "bad gateway".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ClientError::NotConnected.error_kind(), "not_connected");
        assert_eq!(ClientError::RateLimited.error_kind(), "rate_limited");
        assert_eq!(ClientError::JobCanceled.error_kind(), "job_canceled");
    }
}
