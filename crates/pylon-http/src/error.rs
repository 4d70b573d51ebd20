//! HTTP error types

use thiserror::Error;

/// Errors surfaced by the REST request core.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Transport-level failure (connect, TLS, read)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Definitive client error (4xx other than 429): retrying can never help
    #[error("Request to {bucket} failed with status {status}: {message}")]
    RequestFailed {
        bucket: String,
        status: u16,
        /// API-specific error code from the response body, if present
        code: Option<u64>,
        message: String,
    },

    /// Retryable failures (429, 5xx) exhausted the retry budget
    #[error("Request to {bucket} still failing with status {status} after {attempts} attempts")]
    RetriesExhausted {
        bucket: String,
        status: u16,
        attempts: u32,
    },

    /// Response body was not the JSON we expected
    #[error("Invalid response body: {0}")]
    InvalidResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_failed_display() {
        let err = HttpError::RequestFailed {
            bucket: "POST /channels/{channel}/messages".to_string(),
            status: 403,
            code: Some(50_013),
            message: "Missing Permissions".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("403"));
        assert!(text.contains("Missing Permissions"));
    }

    #[test]
    fn test_retries_exhausted_display() {
        let err = HttpError::RetriesExhausted {
            bucket: "GET /gateway/bot".to_string(),
            status: 502,
            attempts: 5,
        };
        assert!(err.to_string().contains("5 attempts"));
    }
}
