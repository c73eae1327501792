//! Upstream SQL text and result-row mapping for the three phases.
//!
//! Column mnemonics follow the source ERP tables (MMOPLP planned orders,
//! MWOHED manufacturing orders, OOLINE customer order lines). Everything
//! comes back as JSON; scalars are kept as text verbatim, nested attribute
//! bags are preserved whole under the `attributes` key.

use millrace_protocol::PhaseKind;
use millrace_store::{CustomerOrderLineRow, ManufacturingOrderRow, PlannedOrderRow};
use serde_json::{Map, Value};

const MOPS_COLUMNS: &str = "PLPN, CONO, FACI, WHLO, PRNO, PSTS, ORTY, PPQT, RGDT, STDT, FIDT, RORN, RORL, RORX, LMDT, attributes";
const MOS_COLUMNS: &str = "MOID, CONO, FACI, WHLO, MWNO, PRNO, WHST, ORTY, ORQT, PAQT, RGDT, STDT, FIDT, RORN, RORL, RORX, LMDT, attributes";
const COS_COLUMNS: &str = "OLID, CONO, FACI, WHLO, ORNO, PONR, POSX, ITNO, ORST, ORTP, ORQT, RNQT, JDCD, DLIX, MODL, CUNO, DWDT, CODT, LMDT, attributes";

fn columns(phase: PhaseKind) -> &'static str {
    match phase {
        PhaseKind::Mops => MOPS_COLUMNS,
        PhaseKind::Mos => MOS_COLUMNS,
        PhaseKind::Cos => COS_COLUMNS,
    }
}

/// MIN/MAX/COUNT over the stable numeric identity, for batch planning.
pub fn stats_query(phase: PhaseKind) -> String {
    let contract = phase.contract();
    format!(
        "SELECT MIN({id}) AS min_id, MAX({id}) AS max_id, COUNT(*) AS row_count FROM {table}",
        id = contract.identity_column,
        table = contract.source_table,
    )
}

/// Row select for one id-range batch. `high_water_mark` adds the
/// incremental cutoff predicate; full refresh passes None.
pub fn batch_query(
    phase: PhaseKind,
    id_low: i64,
    id_high: i64,
    high_water_mark: Option<&str>,
) -> String {
    let contract = phase.contract();
    let mut sql = format!(
        "SELECT {cols} FROM {table} WHERE {id} >= {id_low} AND {id} < {id_high}",
        cols = columns(phase),
        table = contract.source_table,
        id = contract.identity_column,
    );
    if let Some(mark) = high_water_mark {
        sql.push_str(&format!(
            " AND {lmdt} >= '{mark}'",
            lmdt = contract.last_modified_column
        ));
    }
    sql.push_str(&format!(" ORDER BY {}", contract.identity_column));
    sql
}

/// Scalar as source text: strings pass through, numbers keep their JSON
/// rendering, everything else is empty.
fn text(row: &Map<String, Value>, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn integer(row: &Map<String, Value>, key: &str) -> i64 {
    match row.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Attribute bag serialized verbatim, preserving the nested sub-groups.
fn attributes(row: &Map<String, Value>) -> Option<String> {
    row.get("attributes")
        .filter(|v| !v.is_null())
        .map(|v| v.to_string())
}

pub fn map_planned_order(env: &str, row: &Map<String, Value>) -> PlannedOrderRow {
    PlannedOrderRow {
        id: 0,
        env: env.to_string(),
        source_id: integer(row, "PLPN"),
        company: text(row, "CONO"),
        facility: text(row, "FACI"),
        warehouse: text(row, "WHLO"),
        plan_number: text(row, "PLPN"),
        product: text(row, "PRNO"),
        status: text(row, "PSTS"),
        order_type: text(row, "ORTY"),
        quantity: text(row, "PPQT"),
        entry_date: text(row, "RGDT"),
        start_date: text(row, "STDT"),
        finish_date: text(row, "FIDT"),
        customer_order_number: text(row, "RORN"),
        customer_order_line: text(row, "RORL"),
        customer_order_suffix: text(row, "RORX"),
        attributes: attributes(row),
        last_modified: text(row, "LMDT"),
        order_type_description: None,
        item_description: None,
        deleted_remotely: false,
        sync_timestamp: String::new(),
    }
}

pub fn map_manufacturing_order(env: &str, row: &Map<String, Value>) -> ManufacturingOrderRow {
    ManufacturingOrderRow {
        id: 0,
        env: env.to_string(),
        source_id: integer(row, "MOID"),
        company: text(row, "CONO"),
        facility: text(row, "FACI"),
        warehouse: text(row, "WHLO"),
        order_number: text(row, "MWNO"),
        product: text(row, "PRNO"),
        status: text(row, "WHST"),
        order_type: text(row, "ORTY"),
        quantity: text(row, "ORQT"),
        put_away_quantity: text(row, "PAQT"),
        entry_date: text(row, "RGDT"),
        start_date: text(row, "STDT"),
        finish_date: text(row, "FIDT"),
        customer_order_number: text(row, "RORN"),
        customer_order_line: text(row, "RORL"),
        customer_order_suffix: text(row, "RORX"),
        attributes: attributes(row),
        last_modified: text(row, "LMDT"),
        order_type_description: None,
        item_description: None,
        deleted_remotely: false,
        sync_timestamp: String::new(),
    }
}

pub fn map_customer_order_line(env: &str, row: &Map<String, Value>) -> CustomerOrderLineRow {
    CustomerOrderLineRow {
        id: 0,
        env: env.to_string(),
        source_id: integer(row, "OLID"),
        company: text(row, "CONO"),
        facility: text(row, "FACI"),
        warehouse: text(row, "WHLO"),
        order_number: text(row, "ORNO"),
        line_number: text(row, "PONR"),
        line_suffix: text(row, "POSX"),
        item: text(row, "ITNO"),
        status: text(row, "ORST"),
        order_type: text(row, "ORTP"),
        quantity: text(row, "ORQT"),
        remaining_quantity: text(row, "RNQT"),
        joint_delivery: text(row, "JDCD"),
        delivery_number: text(row, "DLIX"),
        delivery_method: text(row, "MODL"),
        customer: text(row, "CUNO"),
        requested_delivery_date: text(row, "DWDT"),
        confirmed_delivery_date: text(row, "CODT"),
        attributes: attributes(row),
        last_modified: text(row, "LMDT"),
        order_type_description: None,
        customer_name: None,
        delivery_method_description: None,
        item_description: None,
        deleted_remotely: false,
        sync_timestamp: String::new(),
    }
}

/// Reference lookup queries used by the enricher on cache miss.
pub fn reference_query(kind: &str, company: &str, code: &str) -> Option<String> {
    let sql = match kind {
        "order_type" => format!(
            "SELECT TX40 FROM OOTYPE WHERE CONO = '{company}' AND ORTP = '{code}'"
        ),
        "customer" => format!(
            "SELECT CUNM FROM OCUSMA WHERE CONO = '{company}' AND CUNO = '{code}'"
        ),
        "delivery_method" => format!(
            "SELECT TX40 FROM CSYTAB WHERE CONO = '{company}' AND STCO = 'MODL' AND STKY = '{code}'"
        ),
        "item" => format!(
            "SELECT ITDS FROM MITMAS WHERE CONO = '{company}' AND ITNO = '{code}'"
        ),
        _ => return None,
    };
    Some(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_query_targets_identity_column() {
        let sql = stats_query(PhaseKind::Mops);
        assert!(sql.contains("MIN(PLPN)"));
        assert!(sql.contains("FROM MMOPLP"));
    }

    #[test]
    fn batch_query_bounds_are_half_open() {
        let sql = batch_query(PhaseKind::Mos, 100, 200, None);
        assert!(sql.contains("MOID >= 100"));
        assert!(sql.contains("MOID < 200"));
        assert!(!sql.contains("LMDT >="));
    }

    #[test]
    fn batch_query_adds_cutoff_for_incremental() {
        let sql = batch_query(PhaseKind::Mos, 0, 50, Some("20260701"));
        assert!(sql.contains("LMDT >= '20260701'"));
    }

    #[test]
    fn mapping_preserves_source_text() {
        let row: Map<String, Value> = serde_json::from_str(
            r#"{
                "PLPN": 1001, "CONO": "100", "FACI": "F01", "WHLO": "W01",
                "PRNO": "ITEM-1", "PSTS": "20", "PPQT": "10.000",
                "STDT": 20260810, "LMDT": "20260801",
                "attributes": {"discounts": {"DIP1": "2.5"}}
            }"#,
        )
        .unwrap();

        let mapped = map_planned_order("TRN", &row);
        assert_eq!(mapped.source_id, 1001);
        assert_eq!(mapped.plan_number, "1001");
        assert_eq!(mapped.quantity, "10.000");
        assert_eq!(mapped.start_date, "20260810");
        assert!(mapped.attributes.unwrap().contains("DIP1"));
    }

    #[test]
    fn missing_columns_map_to_empty() {
        let row = Map::new();
        let mapped = map_customer_order_line("TRN", &row);
        assert_eq!(mapped.order_number, "");
        assert_eq!(mapped.attributes, None);
    }
}
