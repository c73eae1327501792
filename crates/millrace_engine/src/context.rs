//! Engine service context.
//!
//! Every shared service is an explicit field here - no globals. The context
//! is built once at startup, wrapped in an Arc and handed to the
//! orchestrator, the worker pool and the detector pipeline.

use crate::cancel::CancelRegistry;
use crate::progress::ProgressSender;
use async_trait::async_trait;
use millrace_bus::Bus;
use millrace_db::MillraceDb;
use millrace_protocol::{EnvId, JobId};
use millrace_store::{
    ConfigResolver, IssueStore, JobStore, ReferenceCache, SettingsStore, SnapshotStore,
};
use millrace_upstream::{RateLimiter, SqlJobClient};
use std::sync::Arc;

/// Outcome summary the detector pipeline reports back to the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionSummary {
    pub detectors_run: u32,
    pub detectors_failed: u32,
    pub detectors_skipped: u32,
    pub issues_found: u64,
    pub alerts_raised: u64,
}

/// Seam between the engine and the detector suite. The concrete pipeline
/// lives in its own crate; tests plug in a stub.
#[async_trait]
pub trait DetectorPipeline: Send + Sync {
    /// Run detectors for a job. An empty `only` list means every enabled
    /// detector; otherwise execution is restricted to the named ones.
    async fn run(
        &self,
        env: &EnvId,
        job_id: JobId,
        only: &[String],
    ) -> anyhow::Result<DetectionSummary>;
}

/// Shared services for the refresh engine.
pub struct EngineContext {
    pub db: MillraceDb,
    pub bus: Bus,
    pub fabric: Arc<dyn SqlJobClient>,
    pub limiter: Arc<RateLimiter>,
    pub jobs: JobStore,
    pub snapshots: SnapshotStore,
    pub issues: IssueStore,
    pub config: ConfigResolver,
    pub reference: ReferenceCache,
    pub cancels: CancelRegistry,
    pub progress: ProgressSender,
}

impl EngineContext {
    pub fn new(
        db: MillraceDb,
        bus: Bus,
        fabric: Arc<dyn SqlJobClient>,
        limiter: Arc<RateLimiter>,
        progress: ProgressSender,
    ) -> Self {
        let jobs = JobStore::new(&db);
        let snapshots = SnapshotStore::new(&db);
        let issues = IssueStore::new(&db);
        let config = ConfigResolver::new(SettingsStore::new(&db));
        let reference = ReferenceCache::new(&db);
        Self {
            db,
            bus,
            fabric,
            limiter,
            jobs,
            snapshots,
            issues,
            config,
            reference,
            cancels: CancelRegistry::new(),
            progress,
        }
    }
}
