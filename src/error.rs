use axum::http::StatusCode;

/// Shared error taxonomy for the bridge.
///
/// Provider adapters and the call manager return these as structured results;
/// only the HTTP edge converts them into status codes. 5xx bodies are fixed
/// strings so provider internals never leak to callers.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("missing credential: {0}")]
    CredentialMissing(String),

    #[error("unauthorized webhook: {0}")]
    UnauthorizedWebhook(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("request timeout")]
    RequestTimeout,

    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("no control URL for call {0}")]
    NoControlUrl(String),

    #[error("provider error {status}: {body}")]
    ProviderError { status: u16, body: String },

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("too many concurrent calls (limit {limit})")]
    TooManyCalls { limit: usize },

    #[error("timed out waiting for transcript turn")]
    TranscriptTimeout,

    #[error("TTS unavailable: {0}")]
    TtsUnavailable(String),

    #[error("realtime session disconnected: {0}")]
    RealtimeDisconnected(String),

    #[error("summary generation failed: {0}")]
    SummaryFailed(String),

    #[error("call not found: {0}")]
    CallNotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl BridgeError {
    /// HTTP status for webhook/control responses. Fixed bodies for 5xx
    /// are chosen at the server edge, not here.
    pub fn http_status(&self) -> StatusCode {
        match self {
            BridgeError::UnauthorizedWebhook(_) => StatusCode::UNAUTHORIZED,
            BridgeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            BridgeError::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            BridgeError::BadPayload(_) => StatusCode::BAD_REQUEST,
            BridgeError::CallNotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::TooManyCalls { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BridgeError::RequestTimeout
        } else {
            BridgeError::Internal(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_errors_map_to_expected_statuses() {
        assert_eq!(
            BridgeError::UnauthorizedWebhook("bad sig".into()).http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            BridgeError::RateLimited { retry_after_secs: 5 }.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(BridgeError::PayloadTooLarge.http_status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            BridgeError::BadPayload("x".into()).http_status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn internal_errors_are_500() {
        assert_eq!(
            BridgeError::ProviderError { status: 503, body: "nope".into() }.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
