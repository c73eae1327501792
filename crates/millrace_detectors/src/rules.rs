//! Rule detectors: deterministic issue checks over the snapshot.
//!
//! All quantities and dates arrive as source text; parsing is forgiving
//! (unparseable values drop the row from the check rather than failing the
//! detector) because upstream data quality is exactly what these detectors
//! exist to survive.

use crate::dates::{age_days, days_between, spread_days};
use crate::{DetectorContext, DetectorOutput};
use anyhow::Result;
use millrace_protocol::{settings as keys, ProductionOrderType, Severity};
use millrace_store::snapshot::ProductionOrderLite;
use millrace_store::{CandidateIssue, CustomerOrderLineRow, ThresholdScope};
use serde_json::json;
use std::collections::HashMap;

fn quantity(text: &str) -> f64 {
    text.trim().parse().unwrap_or(0.0)
}

fn order_type_of(kind: &str) -> ProductionOrderType {
    if kind == "MOP" {
        ProductionOrderType::Mop
    } else {
        ProductionOrderType::Mo
    }
}

/// JSON-array setting of strings, or the given default.
async fn string_list(
    ctx: &DetectorContext<'_>,
    key: &str,
    default: &[&str],
) -> Result<Vec<String>> {
    let value = ctx.config.store().get_json(ctx.env, key).await?;
    Ok(match value {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    })
}

// ============================================================================
// unlinked_production_orders
// ============================================================================

/// MOs/MOPs with no customer-order linkage that are old and large enough to
/// matter, outside the excluded statuses and facilities.
pub async fn unlinked_production_orders(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "unlinked_production_orders";
    let excluded_statuses =
        string_list(ctx, &keys::detector_threshold_key(NAME, "excluded_statuses"), &["90"]).await?;
    let excluded_facilities =
        string_list(ctx, &keys::detector_threshold_key(NAME, "excluded_facilities"), &[]).await?;
    let min_age_days = ctx
        .config
        .store()
        .get_i64(ctx.env, &keys::detector_threshold_key(NAME, "min_order_age_days"))
        .await?
        .unwrap_or(1);
    let min_quantity = ctx
        .config
        .store()
        .get_f64(ctx.env, &keys::detector_threshold_key(NAME, "min_quantity_threshold"))
        .await?
        .unwrap_or(0.0);

    let orders = ctx.snapshots.production_orders(ctx.env).await?;
    let mut issues = Vec::new();
    for order in &orders {
        if !order.customer_order_number.is_empty() {
            continue;
        }
        if excluded_statuses.iter().any(|s| s == &order.status) {
            continue;
        }
        if excluded_facilities.iter().any(|f| f == &order.facility) {
            continue;
        }
        let age = age_days(&order.entry_date).unwrap_or(i64::MAX);
        if age < min_age_days {
            continue;
        }
        let qty = quantity(&order.quantity);
        if qty < min_quantity {
            continue;
        }

        issues.push(CandidateIssue {
            facility: order.facility.clone(),
            warehouse: order.warehouse.clone(),
            issue_key: order.order_number.clone(),
            production_order_number: order.order_number.clone(),
            production_order_type: Some(order_type_of(&order.kind)),
            customer_order_number: String::new(),
            customer_order_line: String::new(),
            customer_order_suffix: String::new(),
            issue_data: json!({
                "product": order.product,
                "status": order.status,
                "quantity": qty,
                "age_days": if age == i64::MAX { None } else { Some(age) },
            }),
            severity: Severity::Warning,
        });
    }
    Ok(DetectorOutput::issues(issues))
}

// ============================================================================
// Date-mismatch family
// ============================================================================

/// Orders linked to a customer order, keyed by the CO line reference.
fn linked_by_co_line(
    orders: &[ProductionOrderLite],
) -> HashMap<(String, String, String), Vec<&ProductionOrderLite>> {
    let mut groups: HashMap<(String, String, String), Vec<&ProductionOrderLite>> = HashMap::new();
    for order in orders {
        if order.customer_order_number.is_empty() {
            continue;
        }
        groups
            .entry((
                order.customer_order_number.clone(),
                order.customer_order_line.clone(),
                order.customer_order_suffix.clone(),
            ))
            .or_default()
            .push(order);
    }
    groups
}

fn date_mismatch_issue(
    issue_key: String,
    group: &[&ProductionOrderLite],
    co_ref: Option<(&str, &str, &str)>,
    spread: i64,
    tolerance: f64,
) -> CandidateIssue {
    let first = group[0];
    let (co_number, co_line, co_suffix) = co_ref.unwrap_or(("", "", ""));
    CandidateIssue {
        facility: first.facility.clone(),
        warehouse: first.warehouse.clone(),
        issue_key,
        production_order_number: first.order_number.clone(),
        production_order_type: Some(order_type_of(&first.kind)),
        customer_order_number: co_number.to_string(),
        customer_order_line: co_line.to_string(),
        customer_order_suffix: co_suffix.to_string(),
        issue_data: json!({
            "spread_days": spread,
            "tolerance_days": tolerance,
            "orders": group
                .iter()
                .map(|o| json!({"order": o.order_number, "kind": o.kind, "start_date": o.start_date}))
                .collect::<Vec<_>>(),
        }),
        severity: Severity::Warning,
    }
}

/// Linked production orders of one CO line should agree on their planned
/// start date; a spread beyond the resolved tolerance is flagged.
pub async fn start_date_mismatch(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "start_date_mismatch";
    let key = keys::detector_threshold_key(NAME, "tolerance_days");

    let orders = ctx.snapshots.production_orders(ctx.env).await?;
    let mut issues = Vec::new();
    for ((co, line, suffix), group) in linked_by_co_line(&orders) {
        if group.len() < 2 {
            continue;
        }
        let spread = spread_days(group.iter().map(|o| o.start_date.as_str()));
        let scope = ThresholdScope {
            facility: Some(group[0].facility.clone()),
            warehouse: Some(group[0].warehouse.clone()),
            order_type: Some(group[0].order_type.clone()),
        };
        let tolerance = ctx
            .config
            .resolve_hierarchical_f64(ctx.env, &key, &scope, 0.0)
            .await?;
        if (spread as f64) > tolerance {
            issues.push(date_mismatch_issue(
                format!("{co}:{line}:{suffix}"),
                &group,
                Some((co.as_str(), line.as_str(), suffix.as_str())),
                spread,
                tolerance,
            ));
        }
    }
    Ok(DetectorOutput::issues(issues))
}

/// Same comparison across all production orders whose CO lines share a
/// joint-delivery code.
pub async fn joint_delivery_date_mismatch(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "joint_delivery_date_mismatch";
    group_date_mismatch(ctx, NAME, "JD", |line| {
        (!line.joint_delivery.is_empty()).then(|| line.joint_delivery.clone())
    })
    .await
}

/// Same comparison grouped by delivery number.
pub async fn dlix_date_mismatch(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "dlix_date_mismatch";
    group_date_mismatch(ctx, NAME, "DLIX", |line| {
        (!line.delivery_number.is_empty()).then(|| line.delivery_number.clone())
    })
    .await
}

/// Shared grouping walk for the joint-delivery and DLIX variants: collect
/// the production orders linked to each group's CO lines and compare their
/// start dates under the detector's own tolerance.
async fn group_date_mismatch(
    ctx: &DetectorContext<'_>,
    detector: &str,
    key_prefix: &str,
    group_of: impl Fn(&CustomerOrderLineRow) -> Option<String>,
) -> Result<DetectorOutput> {
    let threshold_key = keys::detector_threshold_key(detector, "tolerance_days");
    let lines = ctx.snapshots.customer_order_lines(ctx.env).await?;
    let orders = ctx.snapshots.production_orders(ctx.env).await?;
    let by_co_line = linked_by_co_line(&orders);

    let mut groups: HashMap<String, Vec<&ProductionOrderLite>> = HashMap::new();
    for line in &lines {
        let Some(group_key) = group_of(line) else {
            continue;
        };
        let co_key = (
            line.order_number.clone(),
            line.line_number.clone(),
            line.line_suffix.clone(),
        );
        if let Some(linked) = by_co_line.get(&co_key) {
            groups.entry(group_key).or_default().extend(linked.iter().copied());
        }
    }

    let mut issues = Vec::new();
    for (group_key, group) in groups {
        if group.len() < 2 {
            continue;
        }
        let spread = spread_days(group.iter().map(|o| o.start_date.as_str()));
        let scope = ThresholdScope {
            facility: Some(group[0].facility.clone()),
            warehouse: Some(group[0].warehouse.clone()),
            order_type: Some(group[0].order_type.clone()),
        };
        let tolerance = ctx
            .config
            .resolve_hierarchical_f64(ctx.env, &threshold_key, &scope, 0.0)
            .await?;
        if (spread as f64) > tolerance {
            issues.push(date_mismatch_issue(
                format!("{key_prefix}:{group_key}"),
                &group,
                None,
                spread,
                tolerance,
            ));
        }
    }
    Ok(DetectorOutput::issues(issues))
}

// ============================================================================
// production_timing
// ============================================================================

/// Days-early / days-late of each linked production order against its CO
/// line's confirmed delivery date.
pub async fn production_timing(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "production_timing";
    let early_key = keys::detector_threshold_key(NAME, "days_early");
    let late_key = keys::detector_threshold_key(NAME, "days_late");

    let lines = ctx.snapshots.customer_order_lines(ctx.env).await?;
    let delivery_dates: HashMap<(String, String, String), &CustomerOrderLineRow> = lines
        .iter()
        .map(|l| {
            (
                (l.order_number.clone(), l.line_number.clone(), l.line_suffix.clone()),
                l,
            )
        })
        .collect();

    let orders = ctx.snapshots.production_orders(ctx.env).await?;
    let mut issues = Vec::new();
    for order in &orders {
        if order.customer_order_number.is_empty() {
            continue;
        }
        let co_key = (
            order.customer_order_number.clone(),
            order.customer_order_line.clone(),
            order.customer_order_suffix.clone(),
        );
        let Some(line) = delivery_dates.get(&co_key) else {
            continue;
        };
        // Positive: the order finishes before the confirmed delivery
        let Some(slack) = days_between(&order.finish_date, &line.confirmed_delivery_date) else {
            continue;
        };

        let scope = ThresholdScope {
            facility: Some(order.facility.clone()),
            warehouse: Some(order.warehouse.clone()),
            order_type: Some(line.order_type.clone()),
        };
        let days_early = ctx
            .config
            .resolve_hierarchical_f64(ctx.env, &early_key, &scope, 7.0)
            .await?;
        let days_late = ctx
            .config
            .resolve_hierarchical_f64(ctx.env, &late_key, &scope, 0.0)
            .await?;

        let verdict = if (slack as f64) > days_early {
            Some(("early", Severity::Info))
        } else if ((-slack) as f64) > days_late {
            Some(("late", Severity::Critical))
        } else {
            None
        };
        let Some((direction, severity)) = verdict else {
            continue;
        };

        issues.push(CandidateIssue {
            facility: order.facility.clone(),
            warehouse: order.warehouse.clone(),
            issue_key: format!("{}:{}", order.order_number, direction),
            production_order_number: order.order_number.clone(),
            production_order_type: Some(order_type_of(&order.kind)),
            customer_order_number: line.order_number.clone(),
            customer_order_line: line.line_number.clone(),
            customer_order_suffix: line.line_suffix.clone(),
            issue_data: json!({
                "direction": direction,
                "slack_days": slack,
                "finish_date": order.finish_date,
                "confirmed_delivery_date": line.confirmed_delivery_date,
                "days_early_threshold": days_early,
                "days_late_threshold": days_late,
            }),
            severity,
        });
    }
    Ok(DetectorOutput::issues(issues))
}

// ============================================================================
// co_quantity_mismatch
// ============================================================================

/// Putaway-aware supply/demand variance per CO line.
///
/// A CO line's remaining quantity is not reduced by an MO until the MO's
/// goods are put away, so outstanding supply counts each MO's quantity net
/// of what is already put away; MOPs count whole.
pub async fn co_quantity_mismatch(ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    const NAME: &str = "co_quantity_mismatch";
    let tolerance_key = keys::detector_threshold_key(NAME, "tolerance_threshold");

    let lines = ctx.snapshots.customer_order_lines(ctx.env).await?;
    let orders = ctx.snapshots.production_orders(ctx.env).await?;
    let by_co_line = linked_by_co_line(&orders);

    let mut issues = Vec::new();
    for line in &lines {
        let co_key = (
            line.order_number.clone(),
            line.line_number.clone(),
            line.line_suffix.clone(),
        );
        let Some(linked) = by_co_line.get(&co_key) else {
            continue;
        };

        let outstanding_supply: f64 = linked
            .iter()
            .map(|o| {
                let qty = quantity(&o.quantity);
                if o.kind == "MO" {
                    (qty - quantity(&o.put_away_quantity)).max(0.0)
                } else {
                    qty
                }
            })
            .sum();
        let remaining_demand = quantity(&line.remaining_quantity);
        let variance = outstanding_supply - remaining_demand;

        let scope = ThresholdScope {
            facility: Some(line.facility.clone()),
            warehouse: Some(line.warehouse.clone()),
            order_type: Some(line.order_type.clone()),
        };
        let tolerance = ctx
            .config
            .resolve_hierarchical_f64(ctx.env, &tolerance_key, &scope, 0.0)
            .await?;
        if variance.abs() <= tolerance {
            continue;
        }

        issues.push(CandidateIssue {
            facility: line.facility.clone(),
            warehouse: line.warehouse.clone(),
            issue_key: format!("{}:{}:{}", line.order_number, line.line_number, line.line_suffix),
            production_order_number: linked[0].order_number.clone(),
            production_order_type: Some(order_type_of(&linked[0].kind)),
            customer_order_number: line.order_number.clone(),
            customer_order_line: line.line_number.clone(),
            customer_order_suffix: line.line_suffix.clone(),
            issue_data: json!({
                "outstanding_supply": outstanding_supply,
                "remaining_demand": remaining_demand,
                "variance": variance,
                "tolerance": tolerance,
                "linked_orders": linked.iter().map(|o| o.order_number.clone()).collect::<Vec<_>>(),
            }),
            severity: if variance < 0.0 { Severity::Critical } else { Severity::Warning },
        });
    }
    Ok(DetectorOutput::issues(issues))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dates::today_yyyymmdd;
    use millrace_db::MillraceDb;
    use millrace_protocol::{EnvId, JobId};
    use millrace_store::{
        ConfigResolver, ManufacturingOrderRow, PlannedOrderRow, SettingType, SettingsStore,
        SnapshotStore,
    };

    struct Fixture {
        env: EnvId,
        snapshots: SnapshotStore,
        settings: SettingsStore,
        config: ConfigResolver,
    }

    impl Fixture {
        fn ctx(&self) -> DetectorContext<'_> {
            DetectorContext {
                env: &self.env,
                job_id: JobId::new(1),
                snapshots: &self.snapshots,
                config: &self.config,
            }
        }
    }

    async fn fixture() -> Fixture {
        let db = MillraceDb::open_memory().await.unwrap();
        db.ensure_schema().await.unwrap();
        let settings = SettingsStore::new(&db);
        Fixture {
            env: EnvId::new("TRN").unwrap(),
            snapshots: SnapshotStore::new(&db),
            config: ConfigResolver::new(settings.clone()),
            settings,
        }
    }

    fn mo(number: &str, facility: &str) -> ManufacturingOrderRow {
        ManufacturingOrderRow {
            env: "TRN".into(),
            source_id: 1,
            facility: facility.into(),
            warehouse: "W01".into(),
            order_number: number.into(),
            status: "40".into(),
            quantity: "10".into(),
            put_away_quantity: "0".into(),
            entry_date: "20260101".into(),
            start_date: "20260810".into(),
            finish_date: "20260814".into(),
            ..Default::default()
        }
    }

    fn linked_mo(number: &str, co: &str, line: &str, start: &str) -> ManufacturingOrderRow {
        let mut row = mo(number, "F01");
        row.customer_order_number = co.into();
        row.customer_order_line = line.into();
        row.customer_order_suffix = "0".into();
        row.start_date = start.into();
        row
    }

    fn co_line(order: &str, line: &str) -> CustomerOrderLineRow {
        CustomerOrderLineRow {
            env: "TRN".into(),
            source_id: 1,
            facility: "F01".into(),
            warehouse: "W01".into(),
            order_number: order.into(),
            line_number: line.into(),
            line_suffix: "0".into(),
            order_type: "MT1".into(),
            quantity: "10".into(),
            remaining_quantity: "10".into(),
            confirmed_delivery_date: "20260815".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unlinked_flags_old_large_orders_only() {
        let f = fixture().await;
        let mut excluded_status = mo("MO-CLOSED", "F01");
        excluded_status.status = "90".into();
        let mut fresh = mo("MO-FRESH", "F01");
        fresh.entry_date = today_yyyymmdd();
        let mut linked = mo("MO-LINKED", "F01");
        linked.customer_order_number = "CO-1".into();
        f.snapshots
            .upsert_manufacturing_orders(
                &[mo("MO-1", "F01"), excluded_status, fresh, linked, mo("MO-2", "F09")],
                "2026-08-01T00:00:00+00:00",
            )
            .await
            .unwrap();
        // F09 excluded by configuration
        f.settings
            .upsert(
                &f.env,
                "detector_unlinked_production_orders_excluded_facilities",
                r#"["F09"]"#,
                SettingType::Json,
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let output = unlinked_production_orders(&f.ctx()).await.unwrap();
        let keys: Vec<_> = output.issues.iter().map(|i| i.issue_key.as_str()).collect();
        assert_eq!(keys, vec!["MO-1"]);
        assert_eq!(
            output.issues[0].production_order_type,
            Some(ProductionOrderType::Mo)
        );
    }

    #[tokio::test]
    async fn unlinked_sees_mops_too() {
        let f = fixture().await;
        let mop = PlannedOrderRow {
            env: "TRN".into(),
            source_id: 7,
            facility: "F01".into(),
            warehouse: "W01".into(),
            plan_number: "P-7".into(),
            status: "20".into(),
            quantity: "5".into(),
            entry_date: "20260101".into(),
            ..Default::default()
        };
        f.snapshots
            .upsert_planned_orders(&[mop], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();

        let output = unlinked_production_orders(&f.ctx()).await.unwrap();
        assert_eq!(output.issues.len(), 1);
        assert_eq!(
            output.issues[0].production_order_type,
            Some(ProductionOrderType::Mop)
        );
    }

    #[tokio::test]
    async fn start_date_mismatch_respects_hierarchical_tolerance() {
        let f = fixture().await;
        f.snapshots
            .upsert_manufacturing_orders(
                &[
                    linked_mo("MO-1", "CO-1", "1", "20260810"),
                    linked_mo("MO-2", "CO-1", "1", "20260811"),
                ],
                "2026-08-01T00:00:00+00:00",
            )
            .await
            .unwrap();

        // Global tolerance 0: a 1-day spread is flagged
        let output = start_date_mismatch(&f.ctx()).await.unwrap();
        assert_eq!(output.issues.len(), 1);
        assert_eq!(output.issues[0].issue_key, "CO-1:1:0");

        // Facility override 2 days suppresses it
        let threshold = serde_json::json!({
            "global": 0,
            "overrides": [{"scope": {"facility": "F01"}, "value": 2}]
        });
        f.settings
            .upsert(
                &f.env,
                "detector_start_date_mismatch_tolerance_days",
                &threshold.to_string(),
                SettingType::Json,
                None,
                None,
                None,
            )
            .await
            .unwrap();
        let output = start_date_mismatch(&f.ctx()).await.unwrap();
        assert!(output.issues.is_empty());
    }

    #[tokio::test]
    async fn joint_delivery_groups_across_lines() {
        let f = fixture().await;
        let mut line_a = co_line("CO-1", "1");
        line_a.joint_delivery = "JD7".into();
        let mut line_b = co_line("CO-2", "1");
        line_b.joint_delivery = "JD7".into();
        f.snapshots
            .upsert_customer_order_lines(&[line_a, line_b], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();
        f.snapshots
            .upsert_manufacturing_orders(
                &[
                    linked_mo("MO-1", "CO-1", "1", "20260810"),
                    linked_mo("MO-2", "CO-2", "1", "20260820"),
                ],
                "2026-08-01T00:00:00+00:00",
            )
            .await
            .unwrap();

        let output = joint_delivery_date_mismatch(&f.ctx()).await.unwrap();
        assert_eq!(output.issues.len(), 1);
        assert_eq!(output.issues[0].issue_key, "JD:JD7");

        // The same orders do not collide on the DLIX detector
        let output = dlix_date_mismatch(&f.ctx()).await.unwrap();
        assert!(output.issues.is_empty());
    }

    #[tokio::test]
    async fn production_timing_flags_late_orders() {
        let f = fixture().await;
        f.snapshots
            .upsert_customer_order_lines(&[co_line("CO-1", "1")], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();
        let mut late = linked_mo("MO-LATE", "CO-1", "1", "20260810");
        late.finish_date = "20260820".into(); // confirmed delivery is 20260815
        f.snapshots
            .upsert_manufacturing_orders(&[late], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();

        let output = production_timing(&f.ctx()).await.unwrap();
        assert_eq!(output.issues.len(), 1);
        assert_eq!(output.issues[0].severity, Severity::Critical);
        assert_eq!(output.issues[0].issue_key, "MO-LATE:late");
    }

    #[tokio::test]
    async fn co_quantity_mismatch_is_putaway_aware() {
        let f = fixture().await;
        f.snapshots
            .upsert_customer_order_lines(&[co_line("CO-1", "1")], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();
        // 10 supplied, 4 already put away: 6 outstanding vs 10 remaining
        let mut supplied = linked_mo("MO-1", "CO-1", "1", "20260810");
        supplied.put_away_quantity = "4".into();
        f.snapshots
            .upsert_manufacturing_orders(&[supplied], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();

        let output = co_quantity_mismatch(&f.ctx()).await.unwrap();
        assert_eq!(output.issues.len(), 1);
        let data = &output.issues[0].issue_data;
        assert_eq!(data["outstanding_supply"], 6.0);
        assert_eq!(data["variance"], -4.0);
        assert_eq!(output.issues[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn co_quantity_within_tolerance_is_quiet() {
        let f = fixture().await;
        f.snapshots
            .upsert_customer_order_lines(&[co_line("CO-1", "1")], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();
        f.snapshots
            .upsert_manufacturing_orders(
                &[linked_mo("MO-1", "CO-1", "1", "20260810")],
                "2026-08-01T00:00:00+00:00",
            )
            .await
            .unwrap();

        let output = co_quantity_mismatch(&f.ctx()).await.unwrap();
        assert!(output.issues.is_empty());
    }
}
