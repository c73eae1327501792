//! Upstream Data Fabric access.
//!
//! The Data Fabric runs SQL asynchronously: submit a job, poll its status,
//! page through results. Every call - submit, status, page, cancel - first
//! acquires one token from the per-environment rate limiter so the whole
//! worker pool shares a single upstream budget.

mod client;
mod error;
mod retry;
mod throttle;

pub use client::{
    DataFabricClient, DataFabricConfig, JobHandle, ResultPage, SqlJobClient, UpstreamJobStatus,
};
pub use error::UpstreamError;
pub use retry::{poll_until_complete, with_retries, RetryPolicy};
pub use throttle::RateLimiter;
