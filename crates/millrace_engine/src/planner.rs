//! Batch planner: derives a disjoint id-range cover for one phase.
//!
//! Id-range partitioning gives disjoint, re-drivable units independent of
//! result ordering. Gaps from deleted rows are tolerated - an empty batch
//! completes immediately on the worker side.

use crate::context::EngineContext;
use crate::sql;
use anyhow::{Context as _, Result};
use millrace_protocol::{subjects, BatchDescriptor, EnvId, JobId, PhaseKind};
use millrace_upstream::poll_until_complete;
use serde_json::Value;
use tracing::info;

/// Outcome of planning one phase.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub phase: PhaseKind,
    pub batches: u32,
    pub row_estimate: u64,
    /// Whether the phase loads whole (reconciliation eligible) or with the
    /// incremental high-water-mark cutoff.
    pub full_refresh: bool,
}

/// Plan a phase and publish its batch descriptors.
///
/// Queries the upstream for MIN/MAX of the table's stable numeric identity
/// and the approximate row count, divides the id range into
/// `ceil(count / batch_size)` equal-width sub-ranges, and publishes each
/// descriptor on the environment-scoped batch subject.
pub async fn plan_phase(
    ctx: &EngineContext,
    job_id: JobId,
    env: &EnvId,
    phase: PhaseKind,
    requested_full_refresh: bool,
) -> Result<PhasePlan> {
    let batch_size = ctx.config.batch_size(env).await?;

    // Explicit full refresh wins over the incremental cutoff; a phase with
    // no prior snapshot has nothing to cut off either. `cos` is always
    // loaded whole because lines are pruned and re-linked upstream.
    let high_water_mark = if requested_full_refresh || !phase.contract().resumable {
        None
    } else {
        ctx.snapshots.high_water_mark(env, phase).await?
    };
    let full_refresh = high_water_mark.is_none();

    let stats = fetch_stats(ctx, env, phase, job_id).await?;
    let Some((min_id, max_id, row_count)) = stats else {
        info!(job_id = %job_id, %phase, "phase is empty upstream, no batches");
        return Ok(PhasePlan {
            phase,
            batches: 0,
            row_estimate: 0,
            full_refresh,
        });
    };

    let num_batches = row_count.div_ceil(batch_size).max(1);
    let span = (max_id - min_id + 1) as u64;
    let width = span.div_ceil(num_batches).max(1) as i64;

    let mut batch_index = 0u32;
    let mut low = min_id;
    let end = max_id + 1;
    while low < end {
        let high = (low + width).min(end);
        let descriptor = BatchDescriptor {
            job_id,
            env: env.clone(),
            phase,
            batch_index,
            id_low: low,
            id_high: high,
            full_refresh,
            cutoff: high_water_mark.clone(),
        };
        ctx.bus
            .publish(&subjects::batch(env, phase), &descriptor)
            .context("publishing batch descriptor")?;
        batch_index += 1;
        low = high;
    }

    info!(
        job_id = %job_id, %phase, batches = batch_index, row_estimate = row_count,
        full_refresh, "phase planned"
    );
    Ok(PhasePlan {
        phase,
        batches: batch_index,
        row_estimate: row_count,
        full_refresh,
    })
}

/// MIN/MAX/COUNT via the regular submit/poll/fetch path. Returns None for
/// an empty table.
async fn fetch_stats(
    ctx: &EngineContext,
    env: &EnvId,
    phase: PhaseKind,
    job_id: JobId,
) -> Result<Option<(i64, i64, u64)>> {
    let cancel = ctx.cancels.flag(job_id);
    let handle = ctx
        .fabric
        .submit(env, &sql::stats_query(phase))
        .await
        .context("submitting stats query")?;
    poll_until_complete(
        ctx.fabric.as_ref(),
        env,
        &handle,
        std::time::Duration::from_secs(millrace_protocol::defaults::DEFAULT_JOB_POLL_DEADLINE_SECS),
        || cancel.is_cancelled(),
    )
    .await
    .context("waiting for stats query")?;

    let page = ctx
        .fabric
        .fetch_page(env, &handle, None, 1)
        .await
        .context("fetching stats row")?;
    let Some(row) = page.rows.first() else {
        return Ok(None);
    };

    let as_i64 = |key: &str| -> Option<i64> {
        match row.get(key) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    };
    let count = as_i64("row_count").unwrap_or(0);
    if count <= 0 {
        return Ok(None);
    }
    match (as_i64("min_id"), as_i64("max_id")) {
        (Some(min_id), Some(max_id)) if max_id >= min_id => {
            Ok(Some((min_id, max_id, count as u64)))
        }
        _ => Ok(None),
    }
}
