use serde::Serialize;
use std::time::Duration;

/// Failure taxonomy for the transcription pipeline.
///
/// Every provider-level failure is mapped onto one of these variants so the
/// orchestrator can make a uniform retry/fallback decision instead of
/// inspecting vendor-specific error shapes.
#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    /// Missing or invalid credentials/config. Fatal for that provider,
    /// triggers immediate fallback, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection reset/refused, DNS failure, TLS handshake failure.
    #[error("network error: {0}")]
    Network(String),

    /// The whole operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP 5xx from the provider.
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// HTTP 4xx other than 429. Treated as an input/configuration defect;
    /// the provider is considered exhausted for this attempt.
    #[error("client error (status {status}): {message}")]
    Client { status: u16, message: String },

    /// HTTP 429.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transport succeeded but the provider returned nothing usable,
    /// including the noise-markers-only case.
    #[error("provider returned no usable transcript")]
    NoTranscript,

    /// Chunked path abandoned early because too many chunks failed.
    #[error("{failed} of {attempted} attempted chunks failed (total {total}), aborting chunked transcription")]
    TooManyChunkFailures {
        failed: usize,
        attempted: usize,
        total: usize,
    },

    /// The full provider chain is exhausted. Carries the network diagnosis
    /// so "my network is down" and "every provider is down" are
    /// distinguishable from the message alone.
    #[error("no transcription provider available: {diagnosis}")]
    NoProviderAvailable { diagnosis: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse category recorded in the attempt log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Network,
    Timeout,
    Server,
    Client,
    RateLimited,
    NoTranscript,
    Other,
}

impl TranscribeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TranscribeError::Configuration(_) => ErrorCategory::Configuration,
            TranscribeError::Network(_) => ErrorCategory::Network,
            TranscribeError::Timeout(_) => ErrorCategory::Timeout,
            TranscribeError::Server { .. } => ErrorCategory::Server,
            TranscribeError::Client { .. } => ErrorCategory::Client,
            TranscribeError::RateLimited(_) => ErrorCategory::RateLimited,
            TranscribeError::NoTranscript => ErrorCategory::NoTranscript,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether the retry loop may re-attempt this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TranscribeError::Network(_)
                | TranscribeError::Timeout(_)
                | TranscribeError::Server { .. }
                | TranscribeError::RateLimited(_)
        )
    }

    /// Maps an HTTP status + response body onto the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => TranscribeError::RateLimited(message),
            s if s >= 500 => TranscribeError::Server { status: s, message },
            s => TranscribeError::Client { status: s, message },
        }
    }
}

impl From<reqwest::Error> for TranscribeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured deadline on the error
            TranscribeError::Timeout(Duration::ZERO)
        } else if let Some(status) = err.status() {
            TranscribeError::from_status(status.as_u16(), err.to_string())
        } else if err.is_connect() || err.is_request() {
            TranscribeError::Network(err.to_string())
        } else {
            TranscribeError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            TranscribeError::from_status(503, "unavailable"),
            TranscribeError::Server { status: 503, .. }
        ));
        assert!(matches!(
            TranscribeError::from_status(429, "slow down"),
            TranscribeError::RateLimited(_)
        ));
        assert!(matches!(
            TranscribeError::from_status(401, "bad key"),
            TranscribeError::Client { status: 401, .. }
        ));
    }

    #[test]
    fn retry_eligibility() {
        assert!(TranscribeError::from_status(503, "").is_retryable());
        assert!(TranscribeError::from_status(429, "").is_retryable());
        assert!(TranscribeError::Network("reset".into()).is_retryable());
        assert!(TranscribeError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!TranscribeError::from_status(401, "").is_retryable());
        assert!(!TranscribeError::Configuration("no key".into()).is_retryable());
        assert!(!TranscribeError::NoTranscript.is_retryable());
    }
}
