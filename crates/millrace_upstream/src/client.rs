//! Async SQL-job client against the Data Fabric.
//!
//! Three calls cover the contract: `POST /jobs` with a SQL body returns the
//! job id; `GET /jobs/{id}` reports status; `GET /jobs/{id}/result` pages
//! rows by cursor. All calls carry the service-account bearer token (token
//! lifecycle is owned by the gateway) and acquire one rate-limiter token
//! before issuing.

use crate::error::UpstreamError;
use crate::throttle::RateLimiter;
use async_trait::async_trait;
use millrace_protocol::{defaults, EnvId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Handle on a submitted upstream SQL job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
}

/// Upstream job status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamJobStatus {
    Running,
    Completed,
    Failed { error: String },
}

/// One page of results. Rows are JSON objects keyed by the selected column
/// aliases; scalar values keep their source text representation.
#[derive(Debug, Clone, Default)]
pub struct ResultPage {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub next_cursor: Option<String>,
}

/// Async SQL-job operations. Object-safe so the engine can swap a fake
/// fabric in for tests.
#[async_trait]
pub trait SqlJobClient: Send + Sync {
    async fn submit(&self, env: &EnvId, sql: &str) -> Result<JobHandle, UpstreamError>;

    async fn status(&self, env: &EnvId, handle: &JobHandle)
        -> Result<UpstreamJobStatus, UpstreamError>;

    async fn fetch_page(
        &self,
        env: &EnvId,
        handle: &JobHandle,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ResultPage, UpstreamError>;

    async fn cancel(&self, env: &EnvId, handle: &JobHandle) -> Result<(), UpstreamError>;
}

/// Data Fabric connection parameters.
#[derive(Debug, Clone)]
pub struct DataFabricConfig {
    pub base_url: String,
    pub bearer_token: String,
    /// Overall deadline for one upstream SQL job.
    pub job_poll_deadline: Duration,
}

impl DataFabricConfig {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
            job_poll_deadline: Duration::from_secs(defaults::DEFAULT_JOB_POLL_DEADLINE_SECS),
        }
    }
}

// Wire shapes of the fabric's three endpoints

#[derive(Serialize)]
struct SubmitBody<'a> {
    sql: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PageResponse {
    #[serde(default)]
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// HTTP implementation of [`SqlJobClient`].
pub struct DataFabricClient {
    http: reqwest::Client,
    config: DataFabricConfig,
    limiter: Arc<RateLimiter>,
}

impl DataFabricClient {
    pub fn new(config: DataFabricConfig, limiter: Arc<RateLimiter>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(defaults::CALL_TIMEOUT_SECS))
            .build()
            .expect("reqwest client construction is infallible with static options");
        Self {
            http,
            config,
            limiter,
        }
    }

    pub fn job_poll_deadline(&self) -> Duration {
        self.config.job_poll_deadline
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn check_error(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(UpstreamError::from_status(status.as_u16(), &body, retry_after))
    }
}

#[async_trait]
impl SqlJobClient for DataFabricClient {
    async fn submit(&self, env: &EnvId, sql: &str) -> Result<JobHandle, UpstreamError> {
        self.limiter.acquire(env).await;
        debug!(env = %env, sql_len = sql.len(), "submitting fabric job");

        let response = self
            .http
            .post(self.url("jobs"))
            .bearer_auth(&self.config.bearer_token)
            .timeout(Duration::from_secs(defaults::SUBMIT_TIMEOUT_SECS))
            .json(&SubmitBody { sql })
            .send()
            .await?;
        let response = Self::check_error(response).await?;
        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        Ok(JobHandle { id: parsed.id })
    }

    async fn status(
        &self,
        env: &EnvId,
        handle: &JobHandle,
    ) -> Result<UpstreamJobStatus, UpstreamError> {
        self.limiter.acquire(env).await;

        let response = self
            .http
            .get(self.url(&format!("jobs/{}", handle.id)))
            .bearer_auth(&self.config.bearer_token)
            .send()
            .await?;
        let response = Self::check_error(response).await?;
        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;

        match parsed.status.as_str() {
            "running" | "pending" | "queued" => Ok(UpstreamJobStatus::Running),
            "completed" => Ok(UpstreamJobStatus::Completed),
            "failed" => Ok(UpstreamJobStatus::Failed {
                error: parsed.error.unwrap_or_else(|| "unknown failure".to_string()),
            }),
            other => Err(UpstreamError::InvalidResponse(format!(
                "unknown job status '{other}'"
            ))),
        }
    }

    async fn fetch_page(
        &self,
        env: &EnvId,
        handle: &JobHandle,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ResultPage, UpstreamError> {
        self.limiter.acquire(env).await;

        let limit = limit.min(defaults::MAX_PAGE_SIZE);
        let mut request = self
            .http
            .get(self.url(&format!("jobs/{}/result", handle.id)))
            .bearer_auth(&self.config.bearer_token)
            .query(&[("limit", limit.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = Self::check_error(request.send().await?).await?;
        let parsed: PageResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        Ok(ResultPage {
            rows: parsed.rows,
            next_cursor: parsed.next_cursor,
        })
    }

    async fn cancel(&self, env: &EnvId, handle: &JobHandle) -> Result<(), UpstreamError> {
        self.limiter.acquire(env).await;

        let response = self
            .http
            .delete(self.url(&format!("jobs/{}", handle.id)))
            .bearer_auth(&self.config.bearer_token)
            .send()
            .await?;
        Self::check_error(response).await?;
        Ok(())
    }
}
