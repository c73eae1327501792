//! Job manager: the only authority on user-visible job status.
//!
//! Transitions are validated against the canonical state machine and
//! applied with compare-and-swap UPDATEs so concurrent callers cannot race
//! a job into an illegal state. Progress writes are last-writer-wins and
//! advisory - callers log and swallow their failures.

use millrace_db::{DbError, MillraceDb, Result};
use millrace_protocol::{
    DetectorStatus, EnvId, JobId, JobKind, JobStatus, PhaseKind, PhaseStatus,
};
use sqlx::SqlitePool;
use tracing::info;

use crate::models::{DetectorRun, Job, JobPhase};
use crate::now_rfc3339;

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
}

/// Last-writer-wins progress patch. Absent fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub current_operation: Option<String>,
    pub records_per_sec: Option<f64>,
    pub eta_seconds: Option<Option<u64>>,
    pub current_batch: Option<u32>,
    pub total_batches: Option<u32>,
    pub mops_processed: Option<u64>,
    pub mos_processed: Option<u64>,
    pub co_lines_processed: Option<u64>,
}

/// Fields accepted by [`JobStore::upsert_phase`].
#[derive(Debug, Clone, Default)]
pub struct PhasePatch {
    pub status: Option<PhaseStatus>,
    pub record_count: Option<u64>,
    pub error_message: Option<Option<String>>,
}

/// Fields accepted by [`JobStore::upsert_detector_run`].
#[derive(Debug, Clone, Default)]
pub struct DetectorPatch {
    pub status: Option<DetectorStatus>,
    pub issues_found: Option<u64>,
    pub error_message: Option<Option<String>>,
}

/// Persistent job state, transitions and progress counters.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(db: &MillraceDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Create a job in `pending`.
    pub async fn create(&self, env: &EnvId, kind: JobKind) -> Result<JobId> {
        let now = now_rfc3339();
        let id = sqlx::query(
            r#"
            INSERT INTO mr_jobs (env, kind, status, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(env.as_str())
        .bind(kind.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!(job_id = id, env = %env, kind = %kind, "Job created");
        Ok(JobId::new(id))
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM mr_jobs WHERE id = ?")
            .bind(job_id.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found(format!("job {job_id}")))
    }

    pub async fn list(&self, env: &EnvId, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM mr_jobs WHERE env = ?");
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY id DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query_as::<_, Job>(&sql).bind(env.as_str());
        if let Some(kind) = filter.kind {
            query = query.bind(kind.as_str());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// The running job of a kind in an environment, if any. The orchestrator
    /// uses this to enforce the one-running-job scheduling invariant.
    pub async fn running_job(&self, env: &EnvId, kind: JobKind) -> Result<Option<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM mr_jobs WHERE env = ? AND kind = ? AND status = 'running' LIMIT 1",
        )
        .bind(env.as_str())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Jobs left `running` by a crashed process, oldest first.
    pub async fn stranded_running_jobs(&self, env: &EnvId) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM mr_jobs WHERE env = ? AND status = 'running' ORDER BY id ASC",
        )
        .bind(env.as_str())
        .fetch_all(&self.pool)
        .await?)
    }

    /// Apply a validated status transition.
    ///
    /// Fails with [`DbError::InvalidState`] if the stored status does not
    /// admit the transition. Transition failures are fatal for the caller.
    pub async fn transition(
        &self,
        job_id: JobId,
        to: JobStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let job = self.get(job_id).await?;
        let from = job.status;
        if !from.can_transition(to) {
            return Err(DbError::invalid_state(format!(
                "job {job_id}: illegal transition {from} -> {to}"
            )));
        }

        let now = now_rfc3339();
        let started_at = match to {
            // Retain the original start on a retry
            JobStatus::Running => Some(job.started_at.clone().unwrap_or_else(|| now.clone())),
            _ => job.started_at.clone(),
        };
        let (completed_at, duration_ms) = if to.is_terminal() {
            let duration = job
                .started_at_utc()
                .map(|t| (chrono::Utc::now() - t).num_milliseconds().max(0));
            (Some(now.clone()), duration)
        } else {
            (None, None)
        };

        // Compare-and-swap on the observed status
        let updated = sqlx::query(
            r#"
            UPDATE mr_jobs
            SET status = ?,
                error_message = COALESCE(?, error_message),
                started_at = ?,
                completed_at = ?,
                duration_ms = ?,
                retry_count = retry_count + (CASE WHEN ? THEN 1 ELSE 0 END),
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(reason)
        .bind(&started_at)
        .bind(&completed_at)
        .bind(duration_ms)
        .bind(from == JobStatus::Failed && to == JobStatus::Running)
        .bind(&now)
        .bind(job_id.as_i64())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DbError::invalid_state(format!(
                "job {job_id}: lost transition race to {to}"
            )));
        }

        info!(job_id = %job_id, %from, %to, "Job transition");
        Ok(())
    }

    /// Last-writer-wins progress update, bumping `updated_at` atomically.
    pub async fn set_progress(&self, job_id: JobId, patch: &ProgressPatch) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mr_jobs
            SET current_step = COALESCE(?, current_step),
                total_steps = COALESCE(?, total_steps),
                current_operation = COALESCE(?, current_operation),
                records_per_sec = COALESCE(?, records_per_sec),
                eta_seconds = CASE WHEN ? THEN ? ELSE eta_seconds END,
                current_batch = COALESCE(?, current_batch),
                total_batches = COALESCE(?, total_batches),
                mops_processed = COALESCE(?, mops_processed),
                mos_processed = COALESCE(?, mos_processed),
                co_lines_processed = COALESCE(?, co_lines_processed),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(patch.current_step.map(|v| v as i64))
        .bind(patch.total_steps.map(|v| v as i64))
        .bind(patch.current_operation.as_deref())
        .bind(patch.records_per_sec)
        .bind(patch.eta_seconds.is_some())
        .bind(patch.eta_seconds.flatten().map(|v| v as i64))
        .bind(patch.current_batch.map(|v| v as i64))
        .bind(patch.total_batches.map(|v| v as i64))
        .bind(patch.mops_processed.map(|v| v as i64))
        .bind(patch.mos_processed.map(|v| v as i64))
        .bind(patch.co_lines_processed.map(|v| v as i64))
        .bind(now_rfc3339())
        .bind(job_id.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Add to one phase's processed-record counter.
    pub async fn add_processed(&self, job_id: JobId, phase: PhaseKind, count: u64) -> Result<()> {
        let column = match phase {
            PhaseKind::Mops => "mops_processed",
            PhaseKind::Mos => "mos_processed",
            PhaseKind::Cos => "co_lines_processed",
        };
        let sql = format!(
            "UPDATE mr_jobs SET {column} = {column} + ?, updated_at = ? WHERE id = ?"
        );
        sqlx::query(&sql)
            .bind(count as i64)
            .bind(now_rfc3339())
            .bind(job_id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create or update the phase record for (job, kind).
    pub async fn upsert_phase(
        &self,
        job_id: JobId,
        kind: PhaseKind,
        patch: &PhasePatch,
    ) -> Result<()> {
        let now = now_rfc3339();
        let status = patch.status.unwrap_or_default();
        let started_at = match patch.status {
            Some(PhaseStatus::Running) => Some(now.clone()),
            _ => None,
        };
        let terminal = patch.status.map(|s| s.is_terminal()).unwrap_or(false);

        sqlx::query(
            r#"
            INSERT INTO mr_job_phases (job_id, kind, status, record_count, error_message, started_at)
            VALUES (?, ?, ?, COALESCE(?, 0), ?, ?)
            ON CONFLICT (job_id, kind) DO UPDATE SET
                status = COALESCE(?, mr_job_phases.status),
                record_count = COALESCE(?, mr_job_phases.record_count),
                error_message = CASE WHEN ? THEN ? ELSE mr_job_phases.error_message END,
                started_at = COALESCE(mr_job_phases.started_at, ?),
                completed_at = CASE WHEN ? THEN ? ELSE mr_job_phases.completed_at END,
                duration_ms = CASE WHEN ?
                    THEN CAST((julianday(?) - julianday(mr_job_phases.started_at)) * 86400000 AS INTEGER)
                    ELSE mr_job_phases.duration_ms END
            "#,
        )
        .bind(job_id.as_i64())
        .bind(kind.as_str())
        .bind(status.as_str())
        .bind(patch.record_count.map(|v| v as i64))
        .bind(patch.error_message.clone().flatten())
        .bind(&started_at)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.record_count.map(|v| v as i64))
        .bind(patch.error_message.is_some())
        .bind(patch.error_message.clone().flatten())
        .bind(&started_at)
        .bind(terminal)
        .bind(&now)
        .bind(terminal)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn phases(&self, job_id: JobId) -> Result<Vec<JobPhase>> {
        Ok(sqlx::query_as::<_, JobPhase>(
            "SELECT * FROM mr_job_phases WHERE job_id = ? ORDER BY kind",
        )
        .bind(job_id.as_i64())
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn phase(&self, job_id: JobId, kind: PhaseKind) -> Result<Option<JobPhase>> {
        Ok(sqlx::query_as::<_, JobPhase>(
            "SELECT * FROM mr_job_phases WHERE job_id = ? AND kind = ?",
        )
        .bind(job_id.as_i64())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Create or update the detector-run record for (job, detector).
    pub async fn upsert_detector_run(
        &self,
        job_id: JobId,
        detector: &str,
        patch: &DetectorPatch,
    ) -> Result<()> {
        let now = now_rfc3339();
        let status = patch.status.unwrap_or_default();
        let started_at = match patch.status {
            Some(DetectorStatus::Running) => Some(now.clone()),
            _ => None,
        };
        let terminal = patch.status.map(|s| s.is_terminal()).unwrap_or(false);

        sqlx::query(
            r#"
            INSERT INTO mr_detector_runs (job_id, detector, status, issues_found, error_message, started_at)
            VALUES (?, ?, ?, COALESCE(?, 0), ?, ?)
            ON CONFLICT (job_id, detector) DO UPDATE SET
                status = COALESCE(?, mr_detector_runs.status),
                issues_found = COALESCE(?, mr_detector_runs.issues_found),
                error_message = CASE WHEN ? THEN ? ELSE mr_detector_runs.error_message END,
                started_at = COALESCE(mr_detector_runs.started_at, ?),
                completed_at = CASE WHEN ? THEN ? ELSE mr_detector_runs.completed_at END,
                duration_ms = CASE WHEN ?
                    THEN CAST((julianday(?) - julianday(mr_detector_runs.started_at)) * 86400000 AS INTEGER)
                    ELSE mr_detector_runs.duration_ms END
            "#,
        )
        .bind(job_id.as_i64())
        .bind(detector)
        .bind(status.as_str())
        .bind(patch.issues_found.map(|v| v as i64))
        .bind(patch.error_message.clone().flatten())
        .bind(&started_at)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.issues_found.map(|v| v as i64))
        .bind(patch.error_message.is_some())
        .bind(patch.error_message.clone().flatten())
        .bind(&started_at)
        .bind(terminal)
        .bind(&now)
        .bind(terminal)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn detector_runs(&self, job_id: JobId) -> Result<Vec<DetectorRun>> {
        Ok(sqlx::query_as::<_, DetectorRun>(
            "SELECT * FROM mr_detector_runs WHERE job_id = ? ORDER BY detector",
        )
        .bind(job_id.as_i64())
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> JobStore {
        let db = MillraceDb::open_memory().await.unwrap();
        db.ensure_schema().await.unwrap();
        JobStore::new(&db)
    }

    fn env() -> EnvId {
        EnvId::new("TRN").unwrap()
    }

    #[tokio::test]
    async fn create_starts_pending() {
        let store = store().await;
        let id = store.create(&env(), JobKind::SnapshotRefresh).await.unwrap();
        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.kind, JobKind::SnapshotRefresh);
        assert_eq!(job.env, env());
    }

    #[tokio::test]
    async fn legal_transition_chain() {
        let store = store().await;
        let id = store.create(&env(), JobKind::SnapshotRefresh).await.unwrap();

        store.transition(id, JobStatus::Running, None).await.unwrap();
        assert!(store.get(id).await.unwrap().started_at.is_some());

        store
            .transition(id, JobStatus::Failed, Some("upstream down"))
            .await
            .unwrap();
        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("upstream down"));
        assert!(job.completed_at.is_some());

        // Retry path bumps retry_count
        store.transition(id, JobStatus::Running, None).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn illegal_transitions_rejected() {
        let store = store().await;
        let id = store.create(&env(), JobKind::SnapshotRefresh).await.unwrap();

        assert!(store.transition(id, JobStatus::Completed, None).await.is_err());

        store.transition(id, JobStatus::Running, None).await.unwrap();
        store.transition(id, JobStatus::Cancelled, None).await.unwrap();

        // Cancelled is terminal forever
        assert!(store.transition(id, JobStatus::Running, None).await.is_err());
        assert!(store.transition(id, JobStatus::Cancelled, None).await.is_err());
    }

    #[tokio::test]
    async fn progress_is_last_writer_wins() {
        let store = store().await;
        let id = store.create(&env(), JobKind::SnapshotRefresh).await.unwrap();

        store
            .set_progress(
                id,
                &ProgressPatch {
                    current_batch: Some(2),
                    total_batches: Some(10),
                    records_per_sec: Some(120.5),
                    eta_seconds: Some(Some(30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .set_progress(
                id,
                &ProgressPatch {
                    current_batch: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = store.get(id).await.unwrap();
        assert_eq!(job.current_batch, 3);
        assert_eq!(job.total_batches, 10);
        assert_eq!(job.eta_seconds, Some(30));
    }

    #[tokio::test]
    async fn phase_upsert_is_unique_per_kind() {
        let store = store().await;
        let id = store.create(&env(), JobKind::SnapshotRefresh).await.unwrap();

        store
            .upsert_phase(
                id,
                PhaseKind::Mops,
                &PhasePatch {
                    status: Some(PhaseStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .upsert_phase(
                id,
                PhaseKind::Mops,
                &PhasePatch {
                    status: Some(PhaseStatus::Completed),
                    record_count: Some(42),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let phases = store.phases(id).await.unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].status, PhaseStatus::Completed);
        assert_eq!(phases[0].record_count, 42);
        assert!(phases[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn detector_run_tracks_outcome() {
        let store = store().await;
        let id = store.create(&env(), JobKind::ManualDetection).await.unwrap();

        store
            .upsert_detector_run(
                id,
                "unlinked_production_orders",
                &DetectorPatch {
                    status: Some(DetectorStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .upsert_detector_run(
                id,
                "unlinked_production_orders",
                &DetectorPatch {
                    status: Some(DetectorStatus::Completed),
                    issues_found: Some(7),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let runs = store.detector_runs(id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].issues_found, 7);
        assert_eq!(runs[0].status, DetectorStatus::Completed);
    }

    #[tokio::test]
    async fn running_job_scoped_by_env_and_kind() {
        let store = store().await;
        let id = store.create(&env(), JobKind::SnapshotRefresh).await.unwrap();
        store.transition(id, JobStatus::Running, None).await.unwrap();

        assert!(store
            .running_job(&env(), JobKind::SnapshotRefresh)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .running_job(&env(), JobKind::ManualDetection)
            .await
            .unwrap()
            .is_none());
        let other = EnvId::new("PRD").unwrap();
        assert!(store
            .running_job(&other, JobKind::SnapshotRefresh)
            .await
            .unwrap()
            .is_none());
    }
}
