//! Detector execution: dependency-aware parallel waves.
//!
//! The runner creates a DetectorRun per enabled detector, orders execution
//! into topological waves over the declared dependencies, and runs each
//! wave's detectors in parallel up to the configured cap. A failed detector
//! marks its own run failed and its dependents skipped, but never fails the
//! job - the job completes with a partial-success indication.

use crate::registry::{execute, DetectorSpec, REGISTRY};
use crate::DetectorContext;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures::future::join_all;
use millrace_db::MillraceDb;
use millrace_engine::{CancelRegistry, DetectionSummary, DetectorPipeline};
use millrace_protocol::{DetectorStatus, EnvId, JobId, JobKind};
use millrace_store::{
    AlertStore, CandidateIssue, ConfigResolver, DetectorPatch, IgnoredIssueStore, IssueStore,
    JobStore, ReplaceScope, SettingsStore, SnapshotStore,
};
use std::collections::HashSet;
use tracing::{error, info, warn};

enum RunOutcome {
    Completed { found: u64, alerts: u64 },
    Failed,
}

pub struct DetectorRunner {
    jobs: JobStore,
    snapshots: SnapshotStore,
    issues: IssueStore,
    alerts: AlertStore,
    ignored: IgnoredIssueStore,
    config: ConfigResolver,
    cancels: CancelRegistry,
}

impl DetectorRunner {
    pub fn new(db: &MillraceDb, cancels: CancelRegistry) -> Self {
        Self {
            jobs: JobStore::new(db),
            snapshots: SnapshotStore::new(db),
            issues: IssueStore::new(db),
            alerts: AlertStore::new(db),
            ignored: IgnoredIssueStore::new(db),
            config: ConfigResolver::new(SettingsStore::new(db)),
            cancels,
        }
    }

    /// Detectors selected for this run, in registry order.
    async fn enabled(&self, env: &EnvId, only: &[String]) -> Result<Vec<&'static DetectorSpec>> {
        let mut selected = Vec::new();
        for spec in REGISTRY {
            if !only.is_empty() && !only.iter().any(|n| n == spec.name) {
                continue;
            }
            if self.config.is_detector_enabled(env, spec.name).await? {
                selected.push(spec);
            }
        }
        Ok(selected)
    }

    /// Execute one detector end to end: mark running, execute, filter
    /// ignored issues, replace stored output, record the terminal status.
    async fn run_one(
        &self,
        env: &EnvId,
        job_id: JobId,
        scope: ReplaceScope,
        spec: &DetectorSpec,
    ) -> RunOutcome {
        self.jobs
            .upsert_detector_run(
                job_id,
                spec.name,
                &DetectorPatch {
                    status: Some(DetectorStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .ok();

        let ctx = DetectorContext {
            env,
            job_id,
            snapshots: &self.snapshots,
            config: &self.config,
        };
        let result = execute(spec.name, &ctx).await;

        match result {
            Ok(output) => {
                let kept = match self.filter_ignored(env, spec.name, output.issues).await {
                    Ok(kept) => kept,
                    Err(e) => return self.fail_run(job_id, spec.name, &e).await,
                };
                let found = kept.len() as u64;
                if let Err(e) = self
                    .issues
                    .replace_for_run(env, spec.name, job_id, scope, &kept)
                    .await
                {
                    return self.fail_run(job_id, spec.name, &e.into()).await;
                }
                let alert_count = output.alerts.len() as u64;
                if !output.alerts.is_empty() {
                    if let Err(e) = self
                        .alerts
                        .replace_active_for_run(env, spec.name, job_id, &output.alerts)
                        .await
                    {
                        return self.fail_run(job_id, spec.name, &e.into()).await;
                    }
                }

                self.jobs
                    .upsert_detector_run(
                        job_id,
                        spec.name,
                        &DetectorPatch {
                            status: Some(DetectorStatus::Completed),
                            issues_found: Some(found + alert_count),
                            ..Default::default()
                        },
                    )
                    .await
                    .ok();
                info!(detector = spec.name, job_id = %job_id, found, alerts = alert_count, "detector completed");
                RunOutcome::Completed {
                    found,
                    alerts: alert_count,
                }
            }
            Err(e) => self.fail_run(job_id, spec.name, &e).await,
        }
    }

    async fn fail_run(&self, job_id: JobId, detector: &str, error: &anyhow::Error) -> RunOutcome {
        error!(detector, job_id = %job_id, error = %format!("{error:#}"), "detector failed");
        self.jobs
            .upsert_detector_run(
                job_id,
                detector,
                &DetectorPatch {
                    status: Some(DetectorStatus::Failed),
                    error_message: Some(Some(error.to_string())),
                    ..Default::default()
                },
            )
            .await
            .ok();
        RunOutcome::Failed
    }

    /// Drop candidates matching an IgnoredIssue key.
    async fn filter_ignored(
        &self,
        env: &EnvId,
        detector: &str,
        issues: Vec<CandidateIssue>,
    ) -> Result<Vec<CandidateIssue>> {
        if issues.is_empty() {
            return Ok(issues);
        }
        let suppressed = self.ignored.suppression_set(env, detector).await?;
        if suppressed.is_empty() {
            return Ok(issues);
        }
        Ok(issues
            .into_iter()
            .filter(|issue| {
                !suppressed.contains(&(
                    issue.facility.clone(),
                    issue.issue_key.clone(),
                    issue.production_order_number.clone(),
                ))
            })
            .collect())
    }
}

#[async_trait]
impl DetectorPipeline for DetectorRunner {
    async fn run(
        &self,
        env: &EnvId,
        job_id: JobId,
        only: &[String],
    ) -> Result<DetectionSummary> {
        let job = self.jobs.get(job_id).await.context("loading job")?;
        // Refresh jobs insert under their own id; a manual detection
        // supersedes every earlier run of the detector
        let scope = match job.kind {
            JobKind::SnapshotRefresh => ReplaceScope::ThisJob,
            JobKind::ManualDetection => ReplaceScope::AllJobs,
        };

        let selected = self.enabled(env, only).await?;
        let enabled_names: HashSet<&str> = selected.iter().map(|s| s.name).collect();
        for spec in &selected {
            self.jobs
                .upsert_detector_run(
                    job_id,
                    spec.name,
                    &DetectorPatch {
                        status: Some(DetectorStatus::Pending),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let parallelism = self.config.detector_parallelism(env).await? as usize;
        let cancel = self.cancels.flag(job_id);

        let mut summary = DetectionSummary::default();
        let mut remaining: Vec<&'static DetectorSpec> = selected;
        let mut completed: HashSet<&str> = HashSet::new();
        let mut failed: HashSet<&str> = HashSet::new();

        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                for spec in &remaining {
                    self.jobs
                        .upsert_detector_run(
                            job_id,
                            spec.name,
                            &DetectorPatch {
                                status: Some(DetectorStatus::Cancelled),
                                ..Default::default()
                            },
                        )
                        .await
                        .ok();
                }
                break;
            }

            // Dependents of a failed dependency are terminally skipped
            let mut still_remaining = Vec::new();
            for spec in remaining {
                let dep_failed = spec
                    .depends_on
                    .iter()
                    .any(|dep| enabled_names.contains(dep) && failed.contains(dep));
                if dep_failed {
                    warn!(detector = spec.name, "dependency failed, skipping");
                    self.jobs
                        .upsert_detector_run(
                            job_id,
                            spec.name,
                            &DetectorPatch {
                                status: Some(DetectorStatus::Skipped),
                                ..Default::default()
                            },
                        )
                        .await
                        .ok();
                    summary.detectors_skipped += 1;
                    failed.insert(spec.name);
                } else {
                    still_remaining.push(spec);
                }
            }

            // Next topological wave: everything whose enabled dependencies
            // all completed
            let (wave, rest): (Vec<_>, Vec<_>) = still_remaining.into_iter().partition(|spec| {
                spec.depends_on
                    .iter()
                    .all(|dep| !enabled_names.contains(dep) || completed.contains(dep))
            });
            remaining = rest;
            if wave.is_empty() {
                if !remaining.is_empty() {
                    anyhow::bail!("detector dependency cycle involving {:?}",
                        remaining.iter().map(|s| s.name).collect::<Vec<_>>());
                }
                break;
            }

            for chunk in wave.chunks(parallelism.max(1)) {
                let outcomes = join_all(chunk.iter().map(|spec| async move {
                    (spec.name, self.run_one(env, job_id, scope, spec).await)
                }))
                .await;
                for (name, outcome) in outcomes {
                    match outcome {
                        RunOutcome::Completed { found, alerts } => {
                            summary.detectors_run += 1;
                            summary.issues_found += found;
                            summary.alerts_raised += alerts;
                            completed.insert(name);
                        }
                        RunOutcome::Failed => {
                            summary.detectors_failed += 1;
                            failed.insert(name);
                        }
                    }
                }
            }
        }

        info!(
            job_id = %job_id, run = summary.detectors_run, failed = summary.detectors_failed,
            skipped = summary.detectors_skipped, issues = summary.issues_found,
            alerts = summary.alerts_raised, "detection finished"
        );
        Ok(summary)
    }
}
