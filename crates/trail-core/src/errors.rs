use std::time::Duration;

/// Typed error hierarchy for shipping records to a collector.
/// Classifies errors as fatal (hold, don't retry) or retryable.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DeliveryError {
    // Fatal: the collector will never accept this batch as-is
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("rejected by collector ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::NetworkError(_)
                | Self::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::Rejected { .. } | Self::InvalidPayload(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging and the held-batch table.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::Rejected { .. } => "rejected",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify a non-success HTTP status code.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            408 => Self::ServerError { status, body },
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::Rejected { status, body },
        }
    }
}
