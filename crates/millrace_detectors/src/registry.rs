//! Static detector catalogue.
//!
//! Dependencies are declared data, not code: the runner builds its DAG from
//! `depends_on` and dispatches through [`execute`]. Adding a detector means
//! one registry entry and one match arm.

use crate::{anomaly, rules, DetectorContext, DetectorOutput};
use anyhow::Result;

/// Rule detectors emit issues; anomaly detectors emit alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Rule,
    Anomaly,
}

/// One catalogue entry.
#[derive(Debug, Clone, Copy)]
pub struct DetectorSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: DetectorKind,
    /// Detectors that must complete successfully first.
    pub depends_on: &'static [&'static str],
}

pub const REGISTRY: &[DetectorSpec] = &[
    DetectorSpec {
        name: "unlinked_production_orders",
        label: "Unlinked production orders",
        kind: DetectorKind::Rule,
        depends_on: &[],
    },
    DetectorSpec {
        name: "start_date_mismatch",
        label: "Start date mismatch",
        kind: DetectorKind::Rule,
        depends_on: &[],
    },
    DetectorSpec {
        name: "joint_delivery_date_mismatch",
        label: "Joint delivery date mismatch",
        kind: DetectorKind::Rule,
        depends_on: &[],
    },
    DetectorSpec {
        name: "dlix_date_mismatch",
        label: "Delivery number date mismatch",
        kind: DetectorKind::Rule,
        depends_on: &[],
    },
    DetectorSpec {
        name: "production_timing",
        label: "Production timing",
        kind: DetectorKind::Rule,
        depends_on: &[],
    },
    DetectorSpec {
        name: "co_quantity_mismatch",
        label: "CO quantity mismatch",
        kind: DetectorKind::Rule,
        depends_on: &[],
    },
    DetectorSpec {
        name: "unlinked_concentration",
        label: "Unlinked order concentration",
        kind: DetectorKind::Anomaly,
        depends_on: &["unlinked_production_orders"],
    },
    DetectorSpec {
        name: "date_clustering",
        label: "Start date clustering",
        kind: DetectorKind::Anomaly,
        depends_on: &["start_date_mismatch"],
    },
    DetectorSpec {
        name: "mop_demand_ratio",
        label: "Planned vs firm demand ratio",
        kind: DetectorKind::Anomaly,
        depends_on: &[],
    },
    DetectorSpec {
        name: "absolute_volume",
        label: "Absolute volume",
        kind: DetectorKind::Anomaly,
        depends_on: &[],
    },
];

pub fn spec(name: &str) -> Option<&'static DetectorSpec> {
    REGISTRY.iter().find(|s| s.name == name)
}

/// Uniform dispatch. Unknown names are a programming error upstream of the
/// runner, which only takes names from the registry.
pub async fn execute(name: &str, ctx: &DetectorContext<'_>) -> Result<DetectorOutput> {
    match name {
        "unlinked_production_orders" => rules::unlinked_production_orders(ctx).await,
        "start_date_mismatch" => rules::start_date_mismatch(ctx).await,
        "joint_delivery_date_mismatch" => rules::joint_delivery_date_mismatch(ctx).await,
        "dlix_date_mismatch" => rules::dlix_date_mismatch(ctx).await,
        "production_timing" => rules::production_timing(ctx).await,
        "co_quantity_mismatch" => rules::co_quantity_mismatch(ctx).await,
        "unlinked_concentration" => anomaly::unlinked_concentration(ctx).await,
        "date_clustering" => anomaly::date_clustering(ctx).await,
        "mop_demand_ratio" => anomaly::mop_demand_ratio(ctx).await,
        "absolute_volume" => anomaly::absolute_volume(ctx).await,
        other => anyhow::bail!("unknown detector '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_unique() {
        let mut names: Vec<_> = REGISTRY.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), REGISTRY.len());
    }

    #[test]
    fn dependencies_reference_registered_detectors() {
        for entry in REGISTRY {
            for dep in entry.depends_on {
                assert!(spec(dep).is_some(), "{} depends on unknown {dep}", entry.name);
            }
        }
    }
}
