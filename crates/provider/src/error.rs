#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {status} - {body}")]
    HttpError { status: u16, body: String },

    #[error("SSE stream error: {0}")]
    StreamError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Rate limited. Retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("No initial response within {0}ms")]
    Timeout(u64),
}

impl ProviderError {
    /// Builds the right variant from an HTTP response's status/body, reading
    /// `Retry-After` when the server sent one.
    pub fn from_http(status: u16, body: String, retry_after: Option<&str>) -> Self {
        if status == 429 {
            let retry_after_ms = retry_after
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return ProviderError::RateLimited { retry_after_ms };
        }
        ProviderError::HttpError { status, body }
    }

    /// Transient transport failures are retried with backoff; anything that
    /// indicates a malformed request or permanent rejection is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::HttpError { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            ProviderError::RateLimited { .. } => true,
            ProviderError::StreamError(_) => true,
            ProviderError::Timeout(_) => true,
            ProviderError::DeserializationError(_) => false,
            ProviderError::ContextOverflow(_) => false,
        }
    }

    /// An explicit server-provided delay, when the error carries one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_status_is_retryable_with_delay() {
        let err = ProviderError::from_http(429, String::new(), Some("2"));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms(), Some(2000));
    }

    #[test]
    fn client_error_status_is_not_retryable() {
        let err = ProviderError::from_http(400, "bad request".into(), None);
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_error_status_is_retryable() {
        let err = ProviderError::from_http(503, String::new(), None);
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms(), None);
    }
}
