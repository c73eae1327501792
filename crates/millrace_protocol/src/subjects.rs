//! Bus subject grammar.
//!
//! Subjects are dot-separated tokens. `<ENV>` is an environment tag,
//! `<JOB>` a job id, `<PHASE>` a phase name. Constructors here are the only
//! place subject strings are assembled - components never format subjects
//! by hand.

use crate::types::{EnvId, JobId, PhaseKind};

/// Queue group shared by the batch worker pool. Exactly one member of the
/// group receives each published batch descriptor.
pub const BATCH_WORKER_GROUP: &str = "batch-workers";

/// Inbound refresh request for an environment.
pub fn refresh(env: &EnvId) -> String {
    format!("snapshot.refresh.{env}")
}

/// Wildcard over refresh requests for all environments.
pub fn refresh_any() -> String {
    "snapshot.refresh.*".to_string()
}

/// Batch descriptors for one environment + phase, consumed by the worker
/// queue group.
pub fn batch(env: &EnvId, phase: PhaseKind) -> String {
    format!("snapshot.batch.{env}.{phase}")
}

/// Wildcard over all phases of one environment, subscribed by the worker
/// pool. Rooted at a concrete env tag so it never collides with the
/// `snapshot.batch.complete.<JOB>` subjects.
pub fn batch_env_any(env: &EnvId) -> String {
    format!("snapshot.batch.{env}.*")
}

/// Batch completions for one job.
pub fn batch_complete(job_id: JobId) -> String {
    format!("snapshot.batch.complete.{job_id}")
}

/// Phase completions for one job.
pub fn phase_complete(job_id: JobId) -> String {
    format!("snapshot.phase.complete.{job_id}")
}

/// Kicks off the detector phase of a refresh.
pub fn finalize(job_id: JobId) -> String {
    format!("snapshot.finalize.{job_id}")
}

/// Progress snapshots for the SSE bridge.
pub fn progress(job_id: JobId) -> String {
    format!("snapshot.progress.{job_id}")
}

/// Per-job broadcast cancel.
pub fn cancel(job_id: JobId) -> String {
    format!("snapshot.cancel.{job_id}")
}

/// Wildcard over all cancel broadcasts.
pub fn cancel_any() -> String {
    "snapshot.cancel.*".to_string()
}

/// Terminal success event.
pub fn complete(job_id: JobId) -> String {
    format!("snapshot.complete.{job_id}")
}

/// Terminal failure event.
pub fn error(job_id: JobId) -> String {
    format!("snapshot.error.{job_id}")
}

/// Inbound manual detection request.
pub fn analysis_run() -> String {
    "analysis.run".to_string()
}

/// Progress for a manual detection job.
pub fn analysis_progress(job_id: JobId) -> String {
    format!("analysis.progress.{job_id}")
}

/// Terminal event for a manual detection job.
pub fn analysis_complete(job_id: JobId) -> String {
    format!("analysis.complete.{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_embed_env_and_job() {
        let env = EnvId::new("TRN").unwrap();
        assert_eq!(refresh(&env), "snapshot.refresh.TRN");
        assert_eq!(batch(&env, PhaseKind::Mops), "snapshot.batch.TRN.mops");
        assert_eq!(batch_complete(JobId::new(7)), "snapshot.batch.complete.7");
        assert_eq!(cancel(JobId::new(7)), "snapshot.cancel.7");
    }
}
