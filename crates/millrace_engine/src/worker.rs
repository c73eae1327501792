//! Batch worker pool.
//!
//! Workers join the `batch-workers` queue group on the environment's batch
//! subjects, so each published descriptor lands on exactly one worker. A
//! worker submits the batch SQL upstream, polls with bounded backoff, pages
//! results, upserts each page in its own transaction and publishes the
//! batch outcome on the job-scoped completion subject.
//!
//! Cancellation is observed between pages and between upserts - a cancelled
//! batch never leaves a partially-written page behind.

use crate::context::EngineContext;
use crate::progress::ProgressUpdate;
use crate::sql;
use millrace_protocol::{
    defaults, subjects, BatchComplete, BatchDescriptor, EnvId, PhaseKind,
};
use millrace_upstream::{poll_until_complete, with_retries, RetryPolicy, UpstreamError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Handle on the spawned worker tasks.
pub struct BatchWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl BatchWorkerPool {
    /// Spawn `workers_per_env` workers for each environment. All workers
    /// share one queue group, so scaling the pool never duplicates a batch.
    pub fn spawn(ctx: Arc<EngineContext>, envs: &[EnvId], workers_per_env: usize) -> Self {
        let mut handles = Vec::new();
        for env in envs {
            for _ in 0..workers_per_env.max(1) {
                let worker_id = format!("worker-{}", Uuid::new_v4().simple());
                let pattern = subjects::batch_env_any(env);
                let mut sub = ctx
                    .bus
                    .queue_subscribe(&pattern, subjects::BATCH_WORKER_GROUP)
                    .expect("static batch pattern is valid");
                let ctx = ctx.clone();
                handles.push(tokio::spawn(async move {
                    info!(worker_id, pattern, "batch worker listening");
                    while let Some(msg) = sub.recv().await {
                        let descriptor: BatchDescriptor = match msg.decode() {
                            Ok(d) => d,
                            Err(e) => {
                                warn!(subject = %msg.subject, error = %e, "undecodable batch descriptor");
                                continue;
                            }
                        };
                        process_batch(&ctx, &worker_id, descriptor).await;
                    }
                    info!(worker_id, "batch worker stopped");
                }));
            }
        }
        Self { handles }
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Run one batch with whole-batch retries, then publish its outcome.
async fn process_batch(ctx: &EngineContext, worker_id: &str, descriptor: BatchDescriptor) {
    let cancel = ctx.cancels.flag(descriptor.job_id);
    let max_attempts = defaults::DEFAULT_MAX_BATCH_RETRIES.max(1);

    let mut outcome: Result<u64, UpstreamError> = Err(UpstreamError::Cancelled);
    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            outcome = Err(UpstreamError::Cancelled);
            break;
        }
        outcome = run_batch_once(ctx, &descriptor, &cancel).await;
        match &outcome {
            Ok(_) => break,
            Err(UpstreamError::Cancelled) => break,
            // Upstream-job failure and transient errors both retry whole;
            // fatal 4xx gives up immediately
            Err(e) if (e.is_retryable() || matches!(e, UpstreamError::JobFailed(_)))
                && attempt < max_attempts =>
            {
                warn!(
                    worker_id, job_id = %descriptor.job_id, phase = %descriptor.phase,
                    batch = descriptor.batch_index, attempt, error = %e,
                    "batch attempt failed, retrying"
                );
            }
            Err(_) => break,
        }
    }

    match outcome {
        Ok(record_count) => {
            info!(
                worker_id, job_id = %descriptor.job_id, phase = %descriptor.phase,
                batch = descriptor.batch_index, record_count, "batch complete"
            );
            publish_completion(ctx, &descriptor, record_count, true, None);
        }
        Err(UpstreamError::Cancelled) => {
            // Clean abort: the orchestrator has stopped consuming, no
            // completion is owed
            info!(
                worker_id, job_id = %descriptor.job_id, phase = %descriptor.phase,
                batch = descriptor.batch_index, "batch cancelled"
            );
        }
        Err(e) => {
            error!(
                worker_id, job_id = %descriptor.job_id, phase = %descriptor.phase,
                batch = descriptor.batch_index, error = %e, "batch failed permanently"
            );
            publish_completion(ctx, &descriptor, 0, false, Some(e.to_string()));
        }
    }
}

fn publish_completion(
    ctx: &EngineContext,
    descriptor: &BatchDescriptor,
    record_count: u64,
    ok: bool,
    error: Option<String>,
) {
    let completion = BatchComplete {
        job_id: descriptor.job_id,
        phase: descriptor.phase,
        batch_index: descriptor.batch_index,
        record_count,
        ok,
        error,
    };
    if let Err(e) = ctx
        .bus
        .publish(&subjects::batch_complete(descriptor.job_id), &completion)
    {
        error!(job_id = %descriptor.job_id, error = %e, "batch completion publish failed");
    }
}

/// One attempt: submit, poll, page, upsert. Returns the record count.
async fn run_batch_once(
    ctx: &EngineContext,
    descriptor: &BatchDescriptor,
    cancel: &crate::cancel::CancelFlag,
) -> Result<u64, UpstreamError> {
    let env = &descriptor.env;
    let phase = descriptor.phase;

    // Incremental cutoff, fixed by the planner when the batch was cut
    let query = sql::batch_query(
        phase,
        descriptor.id_low,
        descriptor.id_high,
        descriptor.cutoff.as_deref(),
    );
    // Transient submit errors retry in place; anything else escalates to
    // the whole-batch retry loop
    let handle = {
        let fabric = ctx.fabric.clone();
        let env = env.clone();
        let query = query.clone();
        with_retries(RetryPolicy::default(), move || {
            let fabric = fabric.clone();
            let env = env.clone();
            let query = query.clone();
            async move { fabric.submit(&env, &query).await }
        })
        .await?
    };
    poll_until_complete(
        ctx.fabric.as_ref(),
        env,
        &handle,
        Duration::from_secs(defaults::DEFAULT_JOB_POLL_DEADLINE_SECS),
        || cancel.is_cancelled(),
    )
    .await?;

    let page_size = ctx
        .config
        .page_size(env)
        .await
        .map_err(|e| UpstreamError::InvalidResponse(format!("page size setting: {e}")))?;

    let mut record_count = 0u64;
    let mut cursor: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }

        // A transient page failure escalates to the whole-batch retry;
        // upsert-by-key makes the re-run idempotent
        let page = ctx
            .fabric
            .fetch_page(env, &handle, cursor.as_deref(), page_size)
            .await?;

        if !page.rows.is_empty() {
            let upserted = upsert_page(ctx, env, phase, &page.rows)
                .await
                .map_err(|e| UpstreamError::InvalidResponse(format!("page upsert: {e}")))?;
            record_count += upserted;
            ctx.progress.send(ProgressUpdate::Records {
                job_id: descriptor.job_id,
                phase,
                delta: upserted,
            });
            ctx.jobs
                .add_processed(descriptor.job_id, phase, upserted)
                .await
                .ok();
        }

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(record_count)
}

/// Map one result page into snapshot rows and upsert it transactionally.
async fn upsert_page(
    ctx: &EngineContext,
    env: &EnvId,
    phase: PhaseKind,
    rows: &[serde_json::Map<String, serde_json::Value>],
) -> millrace_db::Result<u64> {
    let sync_timestamp = millrace_store::now_rfc3339();
    match phase {
        PhaseKind::Mops => {
            let mapped: Vec<_> = rows
                .iter()
                .map(|r| sql::map_planned_order(env.as_str(), r))
                .collect();
            ctx.snapshots
                .upsert_planned_orders(&mapped, &sync_timestamp)
                .await
        }
        PhaseKind::Mos => {
            let mapped: Vec<_> = rows
                .iter()
                .map(|r| sql::map_manufacturing_order(env.as_str(), r))
                .collect();
            ctx.snapshots
                .upsert_manufacturing_orders(&mapped, &sync_timestamp)
                .await
        }
        PhaseKind::Cos => {
            let mapped: Vec<_> = rows
                .iter()
                .map(|r| sql::map_customer_order_line(env.as_str(), r))
                .collect();
            ctx.snapshots
                .upsert_customer_order_lines(&mapped, &sync_timestamp)
                .await
        }
    }
}
