//! Upstream error taxonomy.
//!
//! Transient errors are retried with bounded backoff inside the operation;
//! fatal errors fail the batch immediately; a cancelled rate-limit wait is
//! cancellation, never failure.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Timeouts, 5xx, connection reset, explicit "try again".
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// 429 with an optional Retry-After hint.
    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// 4xx other than 429 - schema or permission problems. Not retried.
    #[error("fatal upstream error (HTTP {status}): {message}")]
    Fatal { status: u16, message: String },

    /// Per-call or whole-job deadline exceeded.
    #[error("upstream call timed out")]
    Timeout,

    /// The surrounding operation was cancelled while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// The upstream job itself reported failure.
    #[error("upstream job failed: {0}")]
    JobFailed(String),

    /// Response did not match the documented contract.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Whether a retry inside the operation may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Transient(_)
                | UpstreamError::RateLimited { .. }
                | UpstreamError::Timeout
        )
    }

    /// Map an HTTP status + body to the taxonomy.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        match status {
            429 => UpstreamError::RateLimited { retry_after },
            s if s >= 500 => UpstreamError::Transient(format!("HTTP {s}: {body}")),
            s => UpstreamError::Fatal {
                status: s,
                message: body.chars().take(200).collect(),
            },
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_connect() || e.is_request() {
            UpstreamError::Transient(e.to_string())
        } else {
            UpstreamError::InvalidResponse(e.to_string())
        }
    }
}
