//! Top-level refresh coordinator.
//!
//! Drives one snapshot refresh end to end: fan the three phases out as
//! batch jobs over the bus, fan their completions back in, then reconcile,
//! enrich and hand over to the detector pipeline. The orchestrator owns all
//! job-level status decisions; workers only report batch outcomes.

use crate::context::{DetectorPipeline, EngineContext};
use crate::planner::{plan_phase, PhasePlan};
use crate::progress::ProgressUpdate;
use crate::{enrich, reconcile};
use anyhow::{Context as _, Result};
use millrace_bus::Subscription;
use millrace_protocol::{
    defaults, subjects, AnalysisRequest, BatchComplete, EnvId, JobComplete, JobError, JobId,
    JobKind, JobStatus, PhaseComplete, PhaseKind, PhaseStatus, RecordCounters, RefreshOptions,
    RefreshRequest,
};
use millrace_store::models::Job;
use millrace_store::{DetectorPatch, PhasePatch};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

// Pipeline steps surfaced in progress events
const STEP_PLAN: u32 = 1;
const STEP_LOAD: u32 = 2;
const STEP_RECONCILE: u32 = 3;
const STEP_ENRICH: u32 = 4;
const STEP_DETECT: u32 = 5;
const TOTAL_STEPS: u32 = 5;

/// Per-phase fan-in bookkeeping.
struct PhaseCollect {
    expected: u32,
    seen: HashSet<u32>,
    records: u64,
    error: Option<String>,
}

pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    detectors: Arc<dyn DetectorPipeline>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<EngineContext>, detectors: Arc<dyn DetectorPipeline>) -> Self {
        Self { ctx, detectors }
    }

    /// Entry point for `snapshot.refresh.<ENV>` requests.
    pub async fn run_refresh(&self, request: RefreshRequest) -> Result<()> {
        let job = self.ctx.jobs.get(request.job_id).await?;

        // Scheduling invariant: at most one running refresh per environment
        if let Some(running) = self
            .ctx
            .jobs
            .running_job(&request.env, JobKind::SnapshotRefresh)
            .await?
        {
            if running.id != job.id {
                warn!(
                    job_id = %request.job_id, running = running.id,
                    "refresh already running in this environment, skipping"
                );
                return Ok(());
            }
        }

        let job_id = request.job_id;
        let env = request.env.clone();
        match self.drive(job, request.options, false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_job(job_id, &env, &e).await;
                Err(e)
            }
        }
    }

    /// Resume work left behind by a crashed process. Completed phases of
    /// resumable refreshes are kept; everything else is re-driven. Stranded
    /// manual-detection jobs are failed outright.
    pub async fn recover(&self, env: &EnvId) -> Result<()> {
        for job in self.ctx.jobs.stranded_running_jobs(env).await? {
            let job_id = job.job_id();
            match job.kind {
                JobKind::SnapshotRefresh => {
                    info!(job_id = %job_id, "resuming stranded refresh");
                    let options = RefreshOptions::default();
                    if let Err(e) = self.drive(job, options, true).await {
                        self.fail_job(job_id, env, &e).await;
                    }
                }
                JobKind::ManualDetection => {
                    warn!(job_id = %job_id, "failing stranded manual detection");
                    self.ctx
                        .jobs
                        .transition(job_id, JobStatus::Failed, Some("interrupted by restart"))
                        .await
                        .ok();
                }
            }
        }
        Ok(())
    }

    /// Entry point for `analysis.run` requests.
    pub async fn run_analysis(&self, request: AnalysisRequest) -> Result<()> {
        let job_id = request.job_id;
        let env = request.env.clone();

        if let Some(running) = self
            .ctx
            .jobs
            .running_job(&env, JobKind::ManualDetection)
            .await?
        {
            if running.id != job_id.as_i64() {
                warn!(job_id = %job_id, running = running.id, "manual detection already running, skipping");
                return Ok(());
            }
        }

        self.ctx
            .jobs
            .transition(job_id, JobStatus::Running, None)
            .await?;
        self.ctx.progress.send(ProgressUpdate::Started {
            job_id,
            env: env.clone(),
            kind: JobKind::ManualDetection,
            total_steps: 1,
        });
        self.ctx.progress.send(ProgressUpdate::Operation {
            job_id,
            step: 1,
            description: "Running detectors".to_string(),
        });

        let outcome = self.detectors.run(&env, job_id, &request.detectors).await;
        match outcome {
            Ok(summary) => {
                self.ctx
                    .jobs
                    .transition(job_id, JobStatus::Completed, None)
                    .await?;
                self.ctx.progress.send(ProgressUpdate::Finished {
                    job_id,
                    status: JobStatus::Completed,
                });
                self.ctx
                    .bus
                    .publish(
                        &subjects::analysis_complete(job_id),
                        &JobComplete {
                            job_id,
                            env,
                            counters: RecordCounters::default(),
                            issues_found: summary.issues_found,
                        },
                    )
                    .ok();
                self.ctx.cancels.remove(job_id);
                Ok(())
            }
            Err(e) => {
                self.fail_job(job_id, &env, &e).await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Refresh pipeline
    // ------------------------------------------------------------------

    async fn drive(&self, job: Job, options: RefreshOptions, resume: bool) -> Result<()> {
        let job_id = job.job_id();
        let env = job.env.clone();
        let cancel = self.ctx.cancels.flag(job_id);

        if job.status == JobStatus::Pending {
            self.ctx
                .jobs
                .transition(job_id, JobStatus::Running, None)
                .await
                .context("transitioning job to running")?;
        }

        // Throttle settings are applied at job start; mid-job changes wait
        // for the next job
        let (rate, burst) = self.ctx.config.throttle(&env).await?;
        self.ctx.limiter.configure(&env, rate, burst);

        self.ctx.progress.send(ProgressUpdate::Started {
            job_id,
            env: env.clone(),
            kind: JobKind::SnapshotRefresh,
            total_steps: TOTAL_STEPS,
        });

        // Resumable-phase crash recovery: keep phases a previous process
        // already finished
        let mut skip: HashSet<PhaseKind> = HashSet::new();
        if resume {
            for phase in self.ctx.jobs.phases(job_id).await? {
                if phase.status == PhaseStatus::Completed && phase.kind.contract().resumable {
                    skip.insert(phase.kind);
                }
            }
        }
        let phases: Vec<PhaseKind> = PhaseKind::ALL
            .iter()
            .copied()
            .filter(|p| !skip.contains(p))
            .collect();

        for phase in &phases {
            self.ctx
                .jobs
                .upsert_phase(
                    job_id,
                    *phase,
                    &PhasePatch {
                        status: Some(PhaseStatus::Pending),
                        ..Default::default()
                    },
                )
                .await?;
        }

        // Subscribe before the first descriptor goes out so no completion
        // can be missed
        let completions = self
            .ctx
            .bus
            .subscribe(&subjects::batch_complete(job_id))
            .context("subscribing to batch completions")?;

        self.ctx.progress.send(ProgressUpdate::Operation {
            job_id,
            step: STEP_PLAN,
            description: "Planning batches".to_string(),
        });

        let mut plans: HashMap<PhaseKind, PhasePlan> = HashMap::new();
        let mut total_batches = 0u32;
        let mut expected_records = 0u64;
        for phase in &phases {
            if cancel.is_cancelled() {
                return self.cancel_job(job_id, &env).await;
            }
            let plan = plan_phase(&self.ctx, job_id, &env, *phase, options.full_refresh).await?;
            total_batches += plan.batches;
            expected_records += plan.row_estimate;

            let status = if plan.batches == 0 {
                // Empty phase completes immediately
                self.publish_phase_complete(job_id, *phase, 0, true, None);
                PhaseStatus::Completed
            } else {
                PhaseStatus::Running
            };
            self.ctx
                .jobs
                .upsert_phase(
                    job_id,
                    *phase,
                    &PhasePatch {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .await?;
            plans.insert(*phase, plan);
        }

        self.ctx.progress.send(ProgressUpdate::Expected {
            job_id,
            total: expected_records,
        });
        self.ctx.progress.send(ProgressUpdate::Batches {
            job_id,
            completed_delta: 0,
            total: Some(total_batches),
        });
        self.ctx.progress.send(ProgressUpdate::Operation {
            job_id,
            step: STEP_LOAD,
            description: "Loading snapshot data".to_string(),
        });

        let collected = self
            .collect_batches(job_id, &plans, completions, &cancel)
            .await?;
        if cancel.is_cancelled() {
            return self.cancel_job(job_id, &env).await;
        }

        // Persist phase outcomes and decide job-level status
        let mut failed_phase: Option<(PhaseKind, String)> = None;
        for (phase, collect) in &collected {
            let (status, ok) = match &collect.error {
                None => (PhaseStatus::Completed, true),
                Some(_) => (PhaseStatus::Failed, false),
            };
            self.ctx
                .jobs
                .upsert_phase(
                    job_id,
                    *phase,
                    &PhasePatch {
                        status: Some(status),
                        record_count: Some(collect.records),
                        error_message: Some(collect.error.clone()),
                    },
                )
                .await?;
            self.publish_phase_complete(job_id, *phase, collect.records, ok, collect.error.clone());
            if let Some(error) = &collect.error {
                failed_phase = Some((*phase, error.clone()));
            }
        }
        if let Some((phase, error)) = failed_phase {
            anyhow::bail!("phase {phase} failed: {error}");
        }

        // Phases are in; reconcile full-refresh tables against the start
        let job = self.ctx.jobs.get(job_id).await?;
        let started_at = job
            .started_at
            .clone()
            .context("running job without started_at")?;

        self.ctx.progress.send(ProgressUpdate::Operation {
            job_id,
            step: STEP_RECONCILE,
            description: "Reconciling remote deletions".to_string(),
        });
        let full_refresh_phases: Vec<PhaseKind> = plans
            .values()
            .filter(|p| p.full_refresh)
            .map(|p| p.phase)
            .collect();
        reconcile::reconcile(&self.ctx, &env, job_id, &started_at, &full_refresh_phases).await?;

        if cancel.is_cancelled() {
            return self.cancel_job(job_id, &env).await;
        }
        self.ctx.progress.send(ProgressUpdate::Operation {
            job_id,
            step: STEP_ENRICH,
            description: "Enriching reference data".to_string(),
        });
        enrich::enrich_snapshot(&self.ctx, &env, job_id, &started_at).await?;

        if cancel.is_cancelled() {
            return self.cancel_job(job_id, &env).await;
        }
        self.ctx.progress.send(ProgressUpdate::Operation {
            job_id,
            step: STEP_DETECT,
            description: "Running detectors".to_string(),
        });
        self.ctx
            .bus
            .publish(&subjects::finalize(job_id), &serde_json::json!({ "job_id": job_id }))
            .ok();
        let summary = self.detectors.run(&env, job_id, &[]).await?;

        self.ctx
            .jobs
            .transition(job_id, JobStatus::Completed, None)
            .await?;
        let job = self.ctx.jobs.get(job_id).await?;
        let counters = RecordCounters {
            mops_processed: job.mops_processed.max(0) as u64,
            mos_processed: job.mos_processed.max(0) as u64,
            co_lines_processed: job.co_lines_processed.max(0) as u64,
        };
        self.ctx
            .bus
            .publish(
                &subjects::complete(job_id),
                &JobComplete {
                    job_id,
                    env: env.clone(),
                    counters,
                    issues_found: summary.issues_found,
                },
            )
            .ok();
        self.ctx.progress.send(ProgressUpdate::Finished {
            job_id,
            status: JobStatus::Completed,
        });
        self.ctx.cancels.remove(job_id);
        info!(job_id = %job_id, env = %env, "refresh completed");
        Ok(())
    }

    /// Fan-in: collect completions until every planned batch of every phase
    /// reported, deduplicating by (phase, batch_index). Tolerates
    /// duplicates and ignores stray messages for other jobs.
    async fn collect_batches(
        &self,
        job_id: JobId,
        plans: &HashMap<PhaseKind, PhasePlan>,
        mut completions: Subscription,
        cancel: &crate::cancel::CancelFlag,
    ) -> Result<HashMap<PhaseKind, PhaseCollect>> {
        let mut state: HashMap<PhaseKind, PhaseCollect> = plans
            .iter()
            .filter(|(_, plan)| plan.batches > 0)
            .map(|(phase, plan)| {
                (
                    *phase,
                    PhaseCollect {
                        expected: plan.batches,
                        seen: HashSet::new(),
                        records: 0,
                        error: None,
                    },
                )
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(defaults::REFRESH_JOB_TIMEOUT_SECS);
        loop {
            let outstanding = state
                .values()
                .any(|c| (c.seen.len() as u32) < c.expected);
            if !outstanding {
                break;
            }

            tokio::select! {
                msg = completions.recv() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("batch completion stream closed");
                    };
                    let completion: BatchComplete = match msg.decode() {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(error = %e, "undecodable batch completion");
                            continue;
                        }
                    };
                    if completion.job_id != job_id {
                        continue;
                    }
                    let Some(collect) = state.get_mut(&completion.phase) else {
                        continue;
                    };
                    if !collect.seen.insert(completion.batch_index) {
                        // Duplicate delivery
                        continue;
                    }
                    if completion.ok {
                        collect.records += completion.record_count;
                    } else if collect.error.is_none() {
                        collect.error = completion.error
                            .clone()
                            .or_else(|| Some("batch failed".to_string()));
                    }
                    self.ctx.progress.send(ProgressUpdate::Batches {
                        job_id,
                        completed_delta: 1,
                        total: None,
                    });
                }
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    if cancel.is_cancelled() {
                        // Stop consuming; in-flight workers observe the flag
                        return Ok(state);
                    }
                    if Instant::now() > deadline {
                        anyhow::bail!("refresh exceeded the hard job timeout");
                    }
                }
            }
        }

        Ok(state)
    }

    fn publish_phase_complete(
        &self,
        job_id: JobId,
        phase: PhaseKind,
        record_count: u64,
        ok: bool,
        error: Option<String>,
    ) {
        self.ctx
            .bus
            .publish(
                &subjects::phase_complete(job_id),
                &PhaseComplete {
                    job_id,
                    phase,
                    record_count,
                    ok,
                    error,
                },
            )
            .ok();
    }

    /// Terminal cancellation: mark the job and every non-terminal child
    /// cancelled, skip reconcile/enrich/detect entirely.
    async fn cancel_job(&self, job_id: JobId, env: &EnvId) -> Result<()> {
        info!(job_id = %job_id, env = %env, "cancelling job");
        self.ctx
            .jobs
            .transition(job_id, JobStatus::Cancelled, Some(defaults::CANCELLED_BY_USER_MESSAGE))
            .await
            .ok();

        for phase in self.ctx.jobs.phases(job_id).await.unwrap_or_default() {
            if !phase.status.is_terminal() {
                self.ctx
                    .jobs
                    .upsert_phase(
                        job_id,
                        phase.kind,
                        &PhasePatch {
                            status: Some(PhaseStatus::Cancelled),
                            ..Default::default()
                        },
                    )
                    .await
                    .ok();
            }
        }
        for run in self.ctx.jobs.detector_runs(job_id).await.unwrap_or_default() {
            if !run.status.is_terminal() {
                self.ctx
                    .jobs
                    .upsert_detector_run(
                        job_id,
                        &run.detector,
                        &DetectorPatch {
                            status: Some(millrace_protocol::DetectorStatus::Cancelled),
                            ..Default::default()
                        },
                    )
                    .await
                    .ok();
            }
        }

        self.ctx.progress.send(ProgressUpdate::Finished {
            job_id,
            status: JobStatus::Cancelled,
        });
        self.ctx.cancels.remove(job_id);
        Ok(())
    }

    /// Job-level failure: transition, publish the user-safe message, flush
    /// progress.
    async fn fail_job(&self, job_id: JobId, env: &EnvId, error: &anyhow::Error) {
        error!(job_id = %job_id, env = %env, error = %format!("{error:#}"), "job failed");
        self.ctx
            .jobs
            .transition(job_id, JobStatus::Failed, Some(&error.to_string()))
            .await
            .ok();
        self.ctx
            .bus
            .publish(
                &subjects::error(job_id),
                &JobError {
                    job_id,
                    env: env.clone(),
                    message: error.to_string(),
                },
            )
            .ok();
        self.ctx.progress.send(ProgressUpdate::Finished {
            job_id,
            status: JobStatus::Failed,
        });
        self.ctx.cancels.remove(job_id);
    }
}
