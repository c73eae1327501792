//! Service wiring: build the shared context, spawn the long-lived tasks,
//! subscribe the inbound subjects.
//!
//! The core has no HTTP surface of its own - the gateway publishes
//! `snapshot.refresh.<ENV>` / `analysis.run` requests and subscribes to the
//! progress and terminal subjects.

use anyhow::{Context as _, Result};
use millrace_bus::Bus;
use millrace_db::MillraceDb;
use millrace_detectors::DetectorRunner;
use millrace_engine::{
    spawn_cancel_listener, spawn_progress_publisher, BatchWorkerPool, EngineContext, Orchestrator,
};
use millrace_protocol::{
    subjects, AnalysisRequest, EnvId, JobKind, RefreshOptions, RefreshRequest,
};
use millrace_store::JobStore;
use millrace_upstream::{DataFabricClient, DataFabricConfig, RateLimiter};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct ServiceConfig {
    pub db_path: String,
    pub fabric_url: String,
    pub fabric_token: String,
    pub envs: Vec<String>,
    pub workers_per_env: usize,
}

pub struct Service {
    ctx: Arc<EngineContext>,
    orchestrator: Arc<Orchestrator>,
    envs: Vec<EnvId>,
    _workers: BatchWorkerPool,
}

impl Service {
    pub async fn start(config: ServiceConfig) -> Result<Self> {
        let envs: Vec<EnvId> = config
            .envs
            .iter()
            .map(|tag| EnvId::new(tag))
            .collect::<Result<_, _>>()
            .context("parsing environment tags")?;

        let db = MillraceDb::open(&config.db_path)
            .await
            .with_context(|| format!("opening database {}", config.db_path))?;
        db.ensure_schema().await?;

        let bus = Bus::new();
        let limiter = Arc::new(RateLimiter::new());
        let fabric = Arc::new(DataFabricClient::new(
            DataFabricConfig::new(config.fabric_url.as_str(), config.fabric_token.as_str()),
            limiter.clone(),
        ));

        let (progress, _progress_task) =
            spawn_progress_publisher(bus.clone(), JobStore::new(&db));
        let ctx = Arc::new(EngineContext::new(
            db.clone(),
            bus.clone(),
            fabric,
            limiter,
            progress,
        ));
        spawn_cancel_listener(&bus, ctx.cancels.clone());

        let workers = BatchWorkerPool::spawn(ctx.clone(), &envs, config.workers_per_env);
        let detectors = Arc::new(DetectorRunner::new(&db, ctx.cancels.clone()));
        let orchestrator = Arc::new(Orchestrator::new(ctx.clone(), detectors));

        info!(
            envs = ?envs.iter().map(EnvId::as_str).collect::<Vec<_>>(),
            workers_per_env = config.workers_per_env,
            "millrace service started"
        );

        Ok(Self {
            ctx,
            orchestrator,
            envs,
            _workers: workers,
        })
    }

    /// Serve inbound requests until ctrl-c.
    pub async fn run_until_shutdown(self) -> Result<()> {
        // Crash recovery before accepting new work
        for env in &self.envs {
            if let Err(e) = self.orchestrator.recover(env).await {
                error!(env = %env, error = %format!("{e:#}"), "recovery failed");
            }
        }

        for env in &self.envs {
            let mut sub = self
                .ctx
                .bus
                .subscribe(&subjects::refresh(env))
                .context("subscribing refresh subject")?;
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                while let Some(msg) = sub.recv().await {
                    match msg.decode::<RefreshRequest>() {
                        Ok(request) => {
                            // Job-level failures are already recorded; the
                            // listener keeps serving
                            let _ = orchestrator.run_refresh(request).await;
                        }
                        Err(e) => warn!(subject = %msg.subject, error = %e, "bad refresh request"),
                    }
                }
            });
        }

        let mut analysis = self
            .ctx
            .bus
            .subscribe(&subjects::analysis_run())
            .context("subscribing analysis subject")?;
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            while let Some(msg) = analysis.recv().await {
                match msg.decode::<AnalysisRequest>() {
                    Ok(request) => {
                        let _ = orchestrator.run_analysis(request).await;
                    }
                    Err(e) => warn!(error = %e, "bad analysis request"),
                }
            }
        });

        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        Ok(())
    }

    /// Operator one-shot: run one refresh to completion.
    pub async fn refresh_once(&self, env: &str, full_refresh: bool) -> Result<()> {
        let env = EnvId::new(env)?;
        let job_id = self
            .ctx
            .jobs
            .create(&env, JobKind::SnapshotRefresh)
            .await?;
        info!(job_id = %job_id, env = %env, full_refresh, "refresh job created");

        self.orchestrator
            .run_refresh(RefreshRequest {
                job_id,
                env,
                options: RefreshOptions { full_refresh },
            })
            .await?;

        let job = self.ctx.jobs.get(job_id).await?;
        info!(
            status = %job.status, mops = job.mops_processed, mos = job.mos_processed,
            co_lines = job.co_lines_processed, "refresh finished"
        );
        Ok(())
    }

    /// Operator one-shot: run detectors against the stored snapshot.
    pub async fn detect_once(&self, env: &str, detectors: Vec<String>) -> Result<()> {
        let env = EnvId::new(env)?;
        let job_id = self
            .ctx
            .jobs
            .create(&env, JobKind::ManualDetection)
            .await?;

        self.orchestrator
            .run_analysis(AnalysisRequest {
                job_id,
                env: env.clone(),
                detectors,
            })
            .await?;

        for run in self.ctx.jobs.detector_runs(job_id).await? {
            info!(
                detector = %run.detector, status = %run.status,
                issues = run.issues_found, "detector result"
            );
        }
        Ok(())
    }
}
