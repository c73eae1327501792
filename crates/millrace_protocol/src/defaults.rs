//! Canonical default values shared across the orchestrator and workers.
//!
//! Settings in the store override these; a missing or malformed setting
//! falls back to the value here.

/// Target rows per batch when `compass_batch_size` is unset.
pub const DEFAULT_BATCH_SIZE: u64 = 50_000;

/// Rows per result page when `compass_page_size` is unset.
pub const DEFAULT_PAGE_SIZE: u32 = 10_000;

/// Hard upstream cap on rows per result request.
pub const MAX_PAGE_SIZE: u32 = 100_000;

/// Upstream requests per second per environment.
pub const DEFAULT_THROTTLE_RPS: f64 = 10.0;

/// Token-bucket burst capacity per environment.
pub const DEFAULT_THROTTLE_BURST: u32 = 5;

/// Whole-batch retries before a batch is reported failed.
pub const DEFAULT_MAX_BATCH_RETRIES: u32 = 3;

/// Job-level retries before a refresh is abandoned.
pub const DEFAULT_MAX_JOB_RETRIES: u32 = 2;

/// Upstream submit timeout (seconds).
pub const SUBMIT_TIMEOUT_SECS: u64 = 30;

/// Upstream per-call timeout for status and paging (seconds).
pub const CALL_TIMEOUT_SECS: u64 = 10;

/// Overall deadline for one upstream SQL job (seconds).
pub const DEFAULT_JOB_POLL_DEADLINE_SECS: u64 = 600;

/// Hard wall-clock ceiling for one refresh job (seconds).
pub const REFRESH_JOB_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// Status-poll backoff bounds (milliseconds).
pub const POLL_BACKOFF_BASE_MS: u64 = 250;
pub const POLL_BACKOFF_MAX_MS: u64 = 5_000;

/// Transient-error retry backoff bounds (milliseconds).
pub const RETRY_BACKOFF_BASE_MS: u64 = 500;
pub const RETRY_BACKOFF_MAX_MS: u64 = 15_000;

/// Minimum interval between coalesced progress events (milliseconds).
pub const PROGRESS_COALESCE_MS: u64 = 100;

/// Window for the records/sec EWMA (seconds).
pub const PROGRESS_RATE_WINDOW_SECS: u64 = 10;

/// Cap on published ETA values (seconds).
pub const MAX_ETA_SECS: u64 = 24 * 60 * 60;

/// Reference-data cache TTL (seconds).
pub const REFERENCE_CACHE_TTL_SECS: i64 = 15 * 60;

/// Parallel detectors per wave when the setting is unset.
pub const DEFAULT_DETECTOR_PARALLELISM: u32 = 4;

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
