//! Remote-deletion reconciliation.
//!
//! After a full-refresh phase completes, every row the refresh did not
//! touch was deleted upstream: its sync_timestamp predates the job's start.
//! Such rows are flagged `deleted_remotely`, never deleted. Incremental
//! phases skip reconciliation - an untouched row may simply be unmodified.

use crate::context::EngineContext;
use anyhow::Result;
use millrace_protocol::{EnvId, JobId, PhaseKind};
use tracing::info;

/// Reconcile the given full-refresh phases against the job's start time.
/// One read-committed transaction per table.
pub async fn reconcile(
    ctx: &EngineContext,
    env: &EnvId,
    job_id: JobId,
    started_at: &str,
    full_refresh_phases: &[PhaseKind],
) -> Result<u64> {
    let mut total_flagged = 0u64;
    for phase in full_refresh_phases {
        let flagged = ctx
            .snapshots
            .mark_deleted_before(env, *phase, started_at)
            .await?;
        if flagged > 0 {
            info!(job_id = %job_id, phase = %phase, flagged, "flagged remotely-deleted rows");
        }
        total_flagged += flagged;
    }
    Ok(total_flagged)
}
