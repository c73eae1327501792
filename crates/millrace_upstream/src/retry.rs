//! Retry and polling helpers.
//!
//! Transient errors back off exponentially with jitter; 429 honours the
//! Retry-After hint when present. Polling checks a cancellation probe
//! between status calls and is bounded by the client's whole-job deadline.

use crate::client::{JobHandle, SqlJobClient, UpstreamJobStatus};
use crate::error::UpstreamError;
use millrace_protocol::{defaults, EnvId};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::DEFAULT_MAX_BATCH_RETRIES,
            base: Duration::from_millis(defaults::RETRY_BACKOFF_BASE_MS),
            cap: Duration::from_millis(defaults::RETRY_BACKOFF_MAX_MS),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `n` (1-based), with up to 20% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.cap);
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        capped.mul_f64(1.0 + jitter)
    }
}

/// Run `operation` until success, a non-retryable error, or attempt
/// exhaustion. The final error is returned as-is.
pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let wait = match &e {
                    UpstreamError::RateLimited {
                        retry_after: Some(hint),
                    } => *hint,
                    _ => policy.backoff(attempt),
                };
                warn!(attempt, wait_ms = wait.as_millis() as u64, error = %e, "retrying upstream call");
                sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Poll an upstream job until completion.
///
/// `is_cancelled` is probed between status calls - a cooperative
/// cancellation watchpoint. Exceeding `deadline` maps to
/// [`UpstreamError::Timeout`]; a failed upstream job maps to
/// [`UpstreamError::JobFailed`].
pub async fn poll_until_complete(
    client: &dyn SqlJobClient,
    env: &EnvId,
    handle: &JobHandle,
    deadline: Duration,
    is_cancelled: impl Fn() -> bool,
) -> Result<(), UpstreamError> {
    let started = Instant::now();
    let mut backoff = Duration::from_millis(defaults::POLL_BACKOFF_BASE_MS);
    let cap = Duration::from_millis(defaults::POLL_BACKOFF_MAX_MS);

    loop {
        if is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        if started.elapsed() > deadline {
            return Err(UpstreamError::Timeout);
        }

        match client.status(env, handle).await? {
            UpstreamJobStatus::Completed => {
                debug!(job = %handle.id, elapsed_ms = started.elapsed().as_millis() as u64, "fabric job completed");
                return Ok(());
            }
            UpstreamJobStatus::Failed { error } => {
                return Err(UpstreamError::JobFailed(error));
            }
            UpstreamJobStatus::Running => {
                sleep(backoff).await;
                backoff = (backoff * 2).min(cap);
            }
        }
    }
}
