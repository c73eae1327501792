//! Reference-data enrichment.
//!
//! Joins cached reference lookups (order-type description, customer name,
//! delivery-method description, item description) into the display columns
//! of CO lines touched by this run. Lookups go through the reference cache;
//! a miss falls back to a small upstream query under the same rate limiter.
//! Enrichment is best-effort: a missing lookup leaves the column empty and
//! never fails the phase.

use crate::context::EngineContext;
use crate::sql;
use anyhow::Result;
use millrace_protocol::{defaults, EnvId, JobId, PhaseKind};
use millrace_upstream::poll_until_complete;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

type LookupMemo = HashMap<(String, String, String), Option<String>>;

/// Enrich every row touched at or after `since`: CO lines get the four
/// display columns, production orders get order-type and item
/// descriptions. Each phase's contract names the lookup kinds it takes.
pub async fn enrich_snapshot(
    ctx: &EngineContext,
    env: &EnvId,
    job_id: JobId,
    since: &str,
) -> Result<u64> {
    // Lookups repeat heavily across rows; memoise per run on top of the
    // persistent cache
    let mut seen: LookupMemo = HashMap::new();
    let cancel = ctx.cancels.flag(job_id);

    let mut updated = enrich_customer_order_lines(ctx, env, job_id, since, &mut seen).await?;
    if !cancel.is_cancelled() {
        updated += enrich_production_orders(ctx, env, job_id, since, &mut seen).await?;
    }

    ctx.reference.purge_expired().await.ok();
    Ok(updated)
}

async fn enrich_customer_order_lines(
    ctx: &EngineContext,
    env: &EnvId,
    job_id: JobId,
    since: &str,
    seen: &mut LookupMemo,
) -> Result<u64> {
    let lookups = PhaseKind::Cos.contract().reference_lookups;
    let rows = ctx.snapshots.co_lines_synced_since(env, since).await?;
    let cancel = ctx.cancels.flag(job_id);
    let mut updated = 0u64;

    for row in &rows {
        if cancel.is_cancelled() {
            break;
        }

        let order_type =
            lookup_if(ctx, env, seen, lookups, &row.company, "order_type", &row.order_type).await;
        let customer =
            lookup_if(ctx, env, seen, lookups, &row.company, "customer", &row.customer).await;
        let delivery = lookup_if(
            ctx, env, seen, lookups, &row.company, "delivery_method", &row.delivery_method,
        )
        .await;
        let item = lookup_if(ctx, env, seen, lookups, &row.company, "item", &row.item).await;

        if order_type.is_none() && customer.is_none() && delivery.is_none() && item.is_none() {
            continue;
        }
        ctx.snapshots
            .set_co_line_enrichment(
                row.id,
                order_type.as_deref(),
                customer.as_deref(),
                delivery.as_deref(),
                item.as_deref(),
            )
            .await?;
        updated += 1;
    }

    info!(job_id = %job_id, updated, scanned = rows.len(), "CO line enrichment done");
    Ok(updated)
}

async fn enrich_production_orders(
    ctx: &EngineContext,
    env: &EnvId,
    job_id: JobId,
    since: &str,
    seen: &mut LookupMemo,
) -> Result<u64> {
    let rows = ctx.snapshots.orders_for_enrichment_since(env, since).await?;
    let cancel = ctx.cancels.flag(job_id);
    let mut updated = 0u64;

    for row in &rows {
        if cancel.is_cancelled() {
            break;
        }
        let phase = if row.kind == "MOP" { PhaseKind::Mops } else { PhaseKind::Mos };
        let lookups = phase.contract().reference_lookups;

        let order_type =
            lookup_if(ctx, env, seen, lookups, &row.company, "order_type", &row.order_type).await;
        let item = lookup_if(ctx, env, seen, lookups, &row.company, "item", &row.product).await;
        if order_type.is_none() && item.is_none() {
            continue;
        }
        ctx.snapshots
            .set_order_enrichment(&row.kind, row.id, order_type.as_deref(), item.as_deref())
            .await?;
        updated += 1;
    }

    info!(job_id = %job_id, updated, scanned = rows.len(), "production order enrichment done");
    Ok(updated)
}

/// Resolve a lookup only when the phase contract names its kind.
async fn lookup_if(
    ctx: &EngineContext,
    env: &EnvId,
    seen: &mut LookupMemo,
    enabled: &[&str],
    company: &str,
    kind: &str,
    code: &str,
) -> Option<String> {
    if !enabled.contains(&kind) {
        return None;
    }
    lookup(ctx, env, seen, company, kind, code).await
}

/// Resolve one (company, kind, code) description: per-run memo, then the
/// persistent cache, then upstream. Failures resolve to None.
async fn lookup(
    ctx: &EngineContext,
    env: &EnvId,
    seen: &mut LookupMemo,
    company: &str,
    kind: &str,
    code: &str,
) -> Option<String> {
    if code.is_empty() {
        return None;
    }
    let memo_key = (company.to_string(), kind.to_string(), code.to_string());
    if let Some(cached) = seen.get(&memo_key) {
        return cached.clone();
    }

    let resolved = match ctx.reference.get(env, company, kind, code).await {
        Ok(Some(description)) => Some(description),
        Ok(None) => {
            let fetched = fetch_reference(ctx, env, company, kind, code).await;
            if let Some(description) = &fetched {
                ctx.reference
                    .put(env, company, kind, code, description)
                    .await
                    .ok();
            }
            fetched
        }
        Err(e) => {
            debug!(kind, code, error = %e, "reference cache read failed");
            None
        }
    };

    seen.insert(memo_key, resolved.clone());
    resolved
}

/// One-row reference query through the regular submit/poll/fetch path.
async fn fetch_reference(
    ctx: &EngineContext,
    env: &EnvId,
    company: &str,
    kind: &str,
    code: &str,
) -> Option<String> {
    let query = sql::reference_query(kind, company, code)?;
    let handle = match ctx.fabric.submit(env, &query).await {
        Ok(handle) => handle,
        Err(e) => {
            debug!(kind, code, error = %e, "reference submit failed");
            return None;
        }
    };
    let poll = poll_until_complete(
        ctx.fabric.as_ref(),
        env,
        &handle,
        Duration::from_secs(defaults::DEFAULT_JOB_POLL_DEADLINE_SECS),
        || false,
    )
    .await;
    if let Err(e) = poll {
        debug!(kind, code, error = %e, "reference poll failed");
        return None;
    }

    match ctx.fabric.fetch_page(env, &handle, None, 1).await {
        Ok(page) => page.rows.first().and_then(|row| {
            row.values()
                .next()
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        }),
        Err(e) => {
            debug!(kind, code, error = %e, "reference fetch failed");
            None
        }
    }
}
