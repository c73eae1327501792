//! Statistical anomaly detectors.
//!
//! These aggregate the snapshot instead of judging single rows, and emit
//! [`CandidateAlert`]s at warning/critical thresholds once the affected
//! count clears the configured minimum.

use crate::{DetectorContext, DetectorOutput};
use anyhow::Result;
use millrace_protocol::{settings as keys, AlertEntity, Severity};
use millrace_store::CandidateAlert;
use serde_json::json;
use std::collections::HashMap;

fn quantity(text: &str) -> f64 {
    text.trim().parse().unwrap_or(0.0)
}

struct Thresholds {
    warning: f64,
    critical: f64,
    min_affected: u64,
}

async fn thresholds(
    ctx: &DetectorContext<'_>,
    detector: &str,
    default_warning: f64,
    default_critical: f64,
    default_min_affected: i64,
) -> Result<Thresholds> {
    let store = ctx.config.store();
    let warning = store
        .get_f64(ctx.env, &keys::detector_threshold_key(detector, "warning_threshold"))
        .await?
        .unwrap_or(default_warning);
    let critical = store
        .get_f64(ctx.env, &keys::detector_threshold_key(detector, "critical_threshold"))
        .await?
        .unwrap_or(default_critical);
    let min_affected = store
        .get_i64(ctx.env, &keys::detector_threshold_key(detector, "min_affected"))
        .await?
        .unwrap_or(default_min_affected)
        .max(0) as u64;
    Ok(Thresholds {
        warning,
        critical,
        min_affected,
    })
}

fn severity_for(value: f64, thresholds: &Thresholds) -> Option<Severity> {
    if value >= thresholds.critical {
        Some(Severity::Critical)
    } else if value >= thresholds.warning {
        Some(Severity::Warning)
    } else {
        None
    }
}

/// Share of unlinked production orders per facility.
pub async fn unlinked_concentration(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "unlinked_concentration";
    let thresholds = thresholds(ctx, NAME, 0.3, 0.5, 5).await?;

    let orders = ctx.snapshots.production_orders(ctx.env).await?;
    let mut per_facility: HashMap<String, (u64, u64)> = HashMap::new();
    for order in &orders {
        let entry = per_facility.entry(order.facility.clone()).or_default();
        entry.1 += 1;
        if order.customer_order_number.is_empty() {
            entry.0 += 1;
        }
    }

    let mut alerts = Vec::new();
    for (facility, (unlinked, total)) in per_facility {
        if unlinked < thresholds.min_affected || total == 0 {
            continue;
        }
        let share = unlinked as f64 / total as f64;
        let Some(severity) = severity_for(share, &thresholds) else {
            continue;
        };
        alerts.push(CandidateAlert {
            severity,
            entity_type: AlertEntity::System,
            entity_id: facility.clone(),
            message: format!(
                "{unlinked} of {total} production orders in facility {facility} have no customer order"
            ),
            metrics: json!({"unlinked": unlinked, "total": total, "share": share}),
            affected_count: unlinked,
            threshold_value: thresholds.warning,
            actual_value: share,
        });
    }
    Ok(DetectorOutput::alerts(alerts))
}

/// Pile-ups of planned start dates per warehouse: the largest single-day
/// cluster as a share of that warehouse's linked orders.
pub async fn date_clustering(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "date_clustering";
    let thresholds = thresholds(ctx, NAME, 0.4, 0.6, 5).await?;

    let orders = ctx.snapshots.production_orders(ctx.env).await?;
    let mut per_warehouse: HashMap<String, HashMap<String, u64>> = HashMap::new();
    for order in &orders {
        if order.start_date.is_empty() {
            continue;
        }
        *per_warehouse
            .entry(order.warehouse.clone())
            .or_default()
            .entry(order.start_date.clone())
            .or_default() += 1;
    }

    let mut alerts = Vec::new();
    for (warehouse, by_date) in per_warehouse {
        let total: u64 = by_date.values().sum();
        let Some((peak_date, peak)) = by_date.iter().max_by_key(|(_, count)| **count) else {
            continue;
        };
        if *peak < thresholds.min_affected || total == 0 {
            continue;
        }
        let share = *peak as f64 / total as f64;
        let Some(severity) = severity_for(share, &thresholds) else {
            continue;
        };
        alerts.push(CandidateAlert {
            severity,
            entity_type: AlertEntity::Warehouse,
            entity_id: warehouse.clone(),
            message: format!(
                "{peak} of {total} production orders in warehouse {warehouse} start on {peak_date}"
            ),
            metrics: json!({"peak_date": peak_date, "peak": peak, "total": total, "share": share}),
            affected_count: *peak,
            threshold_value: thresholds.warning,
            actual_value: share,
        });
    }
    Ok(DetectorOutput::alerts(alerts))
}

/// Planned (MOP) vs firm (MO) quantity ratio per product.
pub async fn mop_demand_ratio(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "mop_demand_ratio";
    let thresholds = thresholds(ctx, NAME, 2.0, 4.0, 3).await?;

    let orders = ctx.snapshots.production_orders(ctx.env).await?;
    let mut per_product: HashMap<String, (f64, f64, u64)> = HashMap::new();
    for order in &orders {
        if order.product.is_empty() {
            continue;
        }
        let entry = per_product.entry(order.product.clone()).or_default();
        let qty = quantity(&order.quantity);
        if order.kind == "MOP" {
            entry.0 += qty;
            entry.2 += 1;
        } else {
            entry.1 += qty;
        }
    }

    let mut alerts = Vec::new();
    for (product, (planned, firm, mop_count)) in per_product {
        if mop_count < thresholds.min_affected || firm <= 0.0 {
            continue;
        }
        let ratio = planned / firm;
        let Some(severity) = severity_for(ratio, &thresholds) else {
            continue;
        };
        alerts.push(CandidateAlert {
            severity,
            entity_type: AlertEntity::Product,
            entity_id: product.clone(),
            message: format!(
                "planned quantity for {product} is {ratio:.1}x the firm order quantity"
            ),
            metrics: json!({"planned": planned, "firm": firm, "ratio": ratio}),
            affected_count: mop_count,
            threshold_value: thresholds.warning,
            actual_value: ratio,
        });
    }
    Ok(DetectorOutput::alerts(alerts))
}

/// Raw quantity volume per warehouse against absolute ceilings.
pub async fn absolute_volume(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "absolute_volume";
    let thresholds = thresholds(ctx, NAME, 100_000.0, 250_000.0, 1).await?;

    let orders = ctx.snapshots.production_orders(ctx.env).await?;
    let mut per_warehouse: HashMap<String, (f64, u64)> = HashMap::new();
    for order in &orders {
        let entry = per_warehouse.entry(order.warehouse.clone()).or_default();
        entry.0 += quantity(&order.quantity);
        entry.1 += 1;
    }

    let mut alerts = Vec::new();
    for (warehouse, (volume, count)) in per_warehouse {
        if count < thresholds.min_affected {
            continue;
        }
        let Some(severity) = severity_for(volume, &thresholds) else {
            continue;
        };
        alerts.push(CandidateAlert {
            severity,
            entity_type: AlertEntity::Warehouse,
            entity_id: warehouse.clone(),
            message: format!("warehouse {warehouse} carries {volume:.0} units of planned work"),
            metrics: json!({"volume": volume, "orders": count}),
            affected_count: count,
            threshold_value: thresholds.warning,
            actual_value: volume,
        });
    }
    Ok(DetectorOutput::alerts(alerts))
}
