//! Snapshot row storage: upsert-on-conflict persistence with
//! remote-deletion reconciliation.
//!
//! All upstream scalars are TEXT to preserve the source representation
//! exactly (dates as 8-digit YYYYMMDD, quantities as source text). Rows are
//! never deleted - absence from the latest full refresh only flips
//! `deleted_remotely`. Upsert-by-natural-key is idempotent: a batch
//! re-executed after a crash produces the same effect.

use millrace_db::{MillraceDb, Result};
use millrace_protocol::{EnvId, PhaseKind};
use sqlx::{FromRow, SqlitePool};

/// A planned manufacturing order (MOP) snapshot row.
#[derive(Debug, Clone, Default, FromRow, PartialEq)]
pub struct PlannedOrderRow {
    #[sqlx(default)]
    pub id: i64,
    pub env: String,
    pub source_id: i64,
    pub company: String,
    pub facility: String,
    pub warehouse: String,
    pub plan_number: String,
    pub product: String,
    pub status: String,
    pub order_type: String,
    pub quantity: String,
    pub entry_date: String,
    pub start_date: String,
    pub finish_date: String,
    pub customer_order_number: String,
    pub customer_order_line: String,
    pub customer_order_suffix: String,
    pub attributes: Option<String>,
    pub last_modified: String,
    #[sqlx(default)]
    pub order_type_description: Option<String>,
    #[sqlx(default)]
    pub item_description: Option<String>,
    #[sqlx(default)]
    pub deleted_remotely: bool,
    #[sqlx(default)]
    pub sync_timestamp: String,
}

/// A manufacturing order (MO) snapshot row.
#[derive(Debug, Clone, Default, FromRow, PartialEq)]
pub struct ManufacturingOrderRow {
    #[sqlx(default)]
    pub id: i64,
    pub env: String,
    pub source_id: i64,
    pub company: String,
    pub facility: String,
    pub warehouse: String,
    pub order_number: String,
    pub product: String,
    pub status: String,
    pub order_type: String,
    pub quantity: String,
    pub put_away_quantity: String,
    pub entry_date: String,
    pub start_date: String,
    pub finish_date: String,
    pub customer_order_number: String,
    pub customer_order_line: String,
    pub customer_order_suffix: String,
    pub attributes: Option<String>,
    pub last_modified: String,
    #[sqlx(default)]
    pub order_type_description: Option<String>,
    #[sqlx(default)]
    pub item_description: Option<String>,
    #[sqlx(default)]
    pub deleted_remotely: bool,
    #[sqlx(default)]
    pub sync_timestamp: String,
}

/// A customer order line (CO) snapshot row.
#[derive(Debug, Clone, Default, FromRow, PartialEq)]
pub struct CustomerOrderLineRow {
    #[sqlx(default)]
    pub id: i64,
    pub env: String,
    pub source_id: i64,
    pub company: String,
    pub facility: String,
    pub warehouse: String,
    pub order_number: String,
    pub line_number: String,
    pub line_suffix: String,
    pub item: String,
    pub status: String,
    pub order_type: String,
    pub quantity: String,
    pub remaining_quantity: String,
    pub joint_delivery: String,
    pub delivery_number: String,
    pub delivery_method: String,
    pub customer: String,
    pub requested_delivery_date: String,
    pub confirmed_delivery_date: String,
    pub attributes: Option<String>,
    pub last_modified: String,
    #[sqlx(default)]
    pub order_type_description: Option<String>,
    #[sqlx(default)]
    pub customer_name: Option<String>,
    #[sqlx(default)]
    pub delivery_method_description: Option<String>,
    #[sqlx(default)]
    pub item_description: Option<String>,
    #[sqlx(default)]
    pub deleted_remotely: bool,
    #[sqlx(default)]
    pub sync_timestamp: String,
}

/// A production order (MO or MOP) projected to the fields shared by the
/// detectors. `kind` is "MO" or "MOP".
#[derive(Debug, Clone, FromRow)]
pub struct ProductionOrderLite {
    pub kind: String,
    pub facility: String,
    pub warehouse: String,
    pub order_number: String,
    pub product: String,
    pub status: String,
    pub order_type: String,
    pub quantity: String,
    pub put_away_quantity: String,
    pub entry_date: String,
    pub start_date: String,
    pub finish_date: String,
    pub customer_order_number: String,
    pub customer_order_line: String,
    pub customer_order_suffix: String,
}

/// Enrichment projection of a production order row.
#[derive(Debug, Clone, FromRow)]
pub struct OrderEnrichmentRow {
    pub id: i64,
    pub kind: String,
    pub company: String,
    pub order_type: String,
    pub product: String,
}

/// Snapshot table persistence shared by all batch workers.
#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(db: &MillraceDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    // ------------------------------------------------------------------
    // Upserts (one transaction per page)
    // ------------------------------------------------------------------

    /// Upsert a page of MOP rows. Conflict on the natural key replaces all
    /// source columns and clears `deleted_remotely`; enrichment columns are
    /// left for the enricher.
    pub async fn upsert_planned_orders(
        &self,
        rows: &[PlannedOrderRow],
        sync_timestamp: &str,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO mr_planned_orders (
                    env, source_id, company, facility, warehouse, plan_number,
                    product, status, order_type, quantity, entry_date,
                    start_date, finish_date, customer_order_number,
                    customer_order_line, customer_order_suffix, attributes,
                    last_modified, deleted_remotely, sync_timestamp
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                ON CONFLICT (env, facility, plan_number) DO UPDATE SET
                    source_id = excluded.source_id,
                    company = excluded.company,
                    warehouse = excluded.warehouse,
                    product = excluded.product,
                    status = excluded.status,
                    order_type = excluded.order_type,
                    quantity = excluded.quantity,
                    entry_date = excluded.entry_date,
                    start_date = excluded.start_date,
                    finish_date = excluded.finish_date,
                    customer_order_number = excluded.customer_order_number,
                    customer_order_line = excluded.customer_order_line,
                    customer_order_suffix = excluded.customer_order_suffix,
                    attributes = excluded.attributes,
                    last_modified = excluded.last_modified,
                    deleted_remotely = 0,
                    sync_timestamp = excluded.sync_timestamp
                "#,
            )
            .bind(&row.env)
            .bind(row.source_id)
            .bind(&row.company)
            .bind(&row.facility)
            .bind(&row.warehouse)
            .bind(&row.plan_number)
            .bind(&row.product)
            .bind(&row.status)
            .bind(&row.order_type)
            .bind(&row.quantity)
            .bind(&row.entry_date)
            .bind(&row.start_date)
            .bind(&row.finish_date)
            .bind(&row.customer_order_number)
            .bind(&row.customer_order_line)
            .bind(&row.customer_order_suffix)
            .bind(&row.attributes)
            .bind(&row.last_modified)
            .bind(sync_timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    /// Upsert a page of MO rows.
    pub async fn upsert_manufacturing_orders(
        &self,
        rows: &[ManufacturingOrderRow],
        sync_timestamp: &str,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO mr_manufacturing_orders (
                    env, source_id, company, facility, warehouse, order_number,
                    product, status, order_type, quantity, put_away_quantity,
                    entry_date, start_date, finish_date, customer_order_number,
                    customer_order_line, customer_order_suffix, attributes,
                    last_modified, deleted_remotely, sync_timestamp
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                ON CONFLICT (env, facility, order_number) DO UPDATE SET
                    source_id = excluded.source_id,
                    company = excluded.company,
                    warehouse = excluded.warehouse,
                    product = excluded.product,
                    status = excluded.status,
                    order_type = excluded.order_type,
                    quantity = excluded.quantity,
                    put_away_quantity = excluded.put_away_quantity,
                    entry_date = excluded.entry_date,
                    start_date = excluded.start_date,
                    finish_date = excluded.finish_date,
                    customer_order_number = excluded.customer_order_number,
                    customer_order_line = excluded.customer_order_line,
                    customer_order_suffix = excluded.customer_order_suffix,
                    attributes = excluded.attributes,
                    last_modified = excluded.last_modified,
                    deleted_remotely = 0,
                    sync_timestamp = excluded.sync_timestamp
                "#,
            )
            .bind(&row.env)
            .bind(row.source_id)
            .bind(&row.company)
            .bind(&row.facility)
            .bind(&row.warehouse)
            .bind(&row.order_number)
            .bind(&row.product)
            .bind(&row.status)
            .bind(&row.order_type)
            .bind(&row.quantity)
            .bind(&row.put_away_quantity)
            .bind(&row.entry_date)
            .bind(&row.start_date)
            .bind(&row.finish_date)
            .bind(&row.customer_order_number)
            .bind(&row.customer_order_line)
            .bind(&row.customer_order_suffix)
            .bind(&row.attributes)
            .bind(&row.last_modified)
            .bind(sync_timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    /// Upsert a page of CO line rows.
    pub async fn upsert_customer_order_lines(
        &self,
        rows: &[CustomerOrderLineRow],
        sync_timestamp: &str,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO mr_customer_order_lines (
                    env, source_id, company, facility, warehouse, order_number,
                    line_number, line_suffix, item, status, order_type,
                    quantity, remaining_quantity, joint_delivery,
                    delivery_number, delivery_method, customer,
                    requested_delivery_date, confirmed_delivery_date,
                    attributes, last_modified, deleted_remotely, sync_timestamp
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                ON CONFLICT (env, order_number, line_number, line_suffix) DO UPDATE SET
                    source_id = excluded.source_id,
                    company = excluded.company,
                    facility = excluded.facility,
                    warehouse = excluded.warehouse,
                    item = excluded.item,
                    status = excluded.status,
                    order_type = excluded.order_type,
                    quantity = excluded.quantity,
                    remaining_quantity = excluded.remaining_quantity,
                    joint_delivery = excluded.joint_delivery,
                    delivery_number = excluded.delivery_number,
                    delivery_method = excluded.delivery_method,
                    customer = excluded.customer,
                    requested_delivery_date = excluded.requested_delivery_date,
                    confirmed_delivery_date = excluded.confirmed_delivery_date,
                    attributes = excluded.attributes,
                    last_modified = excluded.last_modified,
                    deleted_remotely = 0,
                    sync_timestamp = excluded.sync_timestamp
                "#,
            )
            .bind(&row.env)
            .bind(row.source_id)
            .bind(&row.company)
            .bind(&row.facility)
            .bind(&row.warehouse)
            .bind(&row.order_number)
            .bind(&row.line_number)
            .bind(&row.line_suffix)
            .bind(&row.item)
            .bind(&row.status)
            .bind(&row.order_type)
            .bind(&row.quantity)
            .bind(&row.remaining_quantity)
            .bind(&row.joint_delivery)
            .bind(&row.delivery_number)
            .bind(&row.delivery_method)
            .bind(&row.customer)
            .bind(&row.requested_delivery_date)
            .bind(&row.confirmed_delivery_date)
            .bind(&row.attributes)
            .bind(&row.last_modified)
            .bind(sync_timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    // ------------------------------------------------------------------
    // Reconciliation & incremental bookkeeping
    // ------------------------------------------------------------------

    /// Highest upstream last-modified value already synced for a phase.
    /// Incremental loads constrain the upstream query to rows at or above
    /// this high-water mark.
    pub async fn high_water_mark(&self, env: &EnvId, phase: PhaseKind) -> Result<Option<String>> {
        let sql = format!(
            "SELECT MAX(last_modified) FROM {} WHERE env = ? AND last_modified != ''",
            phase.contract().local_table
        );
        let mark: Option<String> = sqlx::query_scalar(&sql)
            .bind(env.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(mark)
    }

    /// Flag rows absent from the refresh that started at `cutoff`:
    /// everything whose sync_timestamp is strictly older. One transaction
    /// per table. Returns the number of rows newly flagged.
    pub async fn mark_deleted_before(
        &self,
        env: &EnvId,
        phase: PhaseKind,
        cutoff: &str,
    ) -> Result<u64> {
        let sql = format!(
            r#"UPDATE {} SET deleted_remotely = 1
               WHERE env = ? AND sync_timestamp < ? AND deleted_remotely = 0"#,
            phase.contract().local_table
        );
        let mut tx = self.pool.begin().await?;
        let flagged = sqlx::query(&sql)
            .bind(env.as_str())
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(flagged)
    }

    /// Rows upserted at or after `since` for a phase table.
    pub async fn rows_synced_since(
        &self,
        env: &EnvId,
        phase: PhaseKind,
        since: &str,
    ) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE env = ? AND sync_timestamp >= ?",
            phase.contract().local_table
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(env.as_str())
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Detector / enricher reads
    // ------------------------------------------------------------------

    /// All live production orders (MOs and MOPs) in one projection.
    pub async fn production_orders(&self, env: &EnvId) -> Result<Vec<ProductionOrderLite>> {
        Ok(sqlx::query_as::<_, ProductionOrderLite>(
            r#"
            SELECT 'MO' AS kind, facility, warehouse, order_number, product,
                   status, order_type, quantity, put_away_quantity, entry_date,
                   start_date, finish_date, customer_order_number,
                   customer_order_line, customer_order_suffix
            FROM mr_manufacturing_orders
            WHERE env = ? AND deleted_remotely = 0
            UNION ALL
            SELECT 'MOP' AS kind, facility, warehouse, plan_number AS order_number,
                   product, status, order_type, quantity,
                   '0' AS put_away_quantity, entry_date, start_date, finish_date,
                   customer_order_number, customer_order_line, customer_order_suffix
            FROM mr_planned_orders
            WHERE env = ? AND deleted_remotely = 0
            "#,
        )
        .bind(env.as_str())
        .bind(env.as_str())
        .fetch_all(&self.pool)
        .await?)
    }

    /// All live CO lines for an environment.
    pub async fn customer_order_lines(&self, env: &EnvId) -> Result<Vec<CustomerOrderLineRow>> {
        Ok(sqlx::query_as::<_, CustomerOrderLineRow>(
            "SELECT * FROM mr_customer_order_lines WHERE env = ? AND deleted_remotely = 0",
        )
        .bind(env.as_str())
        .fetch_all(&self.pool)
        .await?)
    }

    /// Production orders (both tables) touched at or after `since`,
    /// projected to the fields the enricher needs. `kind` is "MO"/"MOP".
    pub async fn orders_for_enrichment_since(
        &self,
        env: &EnvId,
        since: &str,
    ) -> Result<Vec<OrderEnrichmentRow>> {
        Ok(sqlx::query_as::<_, OrderEnrichmentRow>(
            r#"
            SELECT id, 'MO' AS kind, company, order_type, product
            FROM mr_manufacturing_orders
            WHERE env = ? AND sync_timestamp >= ?
            UNION ALL
            SELECT id, 'MOP' AS kind, company, order_type, product
            FROM mr_planned_orders
            WHERE env = ? AND sync_timestamp >= ?
            "#,
        )
        .bind(env.as_str())
        .bind(since)
        .bind(env.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Fill production-order display columns. `kind` selects the table.
    pub async fn set_order_enrichment(
        &self,
        kind: &str,
        row_id: i64,
        order_type_description: Option<&str>,
        item_description: Option<&str>,
    ) -> Result<()> {
        let table = if kind == "MOP" {
            "mr_planned_orders"
        } else {
            "mr_manufacturing_orders"
        };
        let sql = format!(
            r#"UPDATE {table}
               SET order_type_description = COALESCE(?, order_type_description),
                   item_description = COALESCE(?, item_description)
               WHERE id = ?"#
        );
        sqlx::query(&sql)
            .bind(order_type_description)
            .bind(item_description)
            .bind(row_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// CO lines touched at or after `since` (enrichment scope).
    pub async fn co_lines_synced_since(
        &self,
        env: &EnvId,
        since: &str,
    ) -> Result<Vec<CustomerOrderLineRow>> {
        Ok(sqlx::query_as::<_, CustomerOrderLineRow>(
            "SELECT * FROM mr_customer_order_lines WHERE env = ? AND sync_timestamp >= ?",
        )
        .bind(env.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Fill CO-line display columns from reference lookups. Missing lookups
    /// stay NULL - enrichment never fails a phase.
    pub async fn set_co_line_enrichment(
        &self,
        row_id: i64,
        order_type_description: Option<&str>,
        customer_name: Option<&str>,
        delivery_method_description: Option<&str>,
        item_description: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mr_customer_order_lines
            SET order_type_description = COALESCE(?, order_type_description),
                customer_name = COALESCE(?, customer_name),
                delivery_method_description = COALESCE(?, delivery_method_description),
                item_description = COALESCE(?, item_description)
            WHERE id = ?
            "#,
        )
        .bind(order_type_description)
        .bind(customer_name)
        .bind(delivery_method_description)
        .bind(item_description)
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Total live rows for a phase table (diagnostics).
    pub async fn row_count(&self, env: &EnvId, phase: PhaseKind) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE env = ? AND deleted_remotely = 0",
            phase.contract().local_table
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(env.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SnapshotStore {
        let db = MillraceDb::open_memory().await.unwrap();
        db.ensure_schema().await.unwrap();
        SnapshotStore::new(&db)
    }

    fn env() -> EnvId {
        EnvId::new("TRN").unwrap()
    }

    fn mop(plan_number: &str, source_id: i64) -> PlannedOrderRow {
        PlannedOrderRow {
            env: "TRN".into(),
            source_id,
            facility: "F01".into(),
            warehouse: "W01".into(),
            plan_number: plan_number.into(),
            product: "ITEM-1".into(),
            status: "20".into(),
            quantity: "10".into(),
            start_date: "20260810".into(),
            last_modified: "20260801".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = store().await;
        let rows = vec![mop("P1", 1), mop("P2", 2)];

        store.upsert_planned_orders(&rows, "2026-08-01T00:00:00+00:00").await.unwrap();
        store.upsert_planned_orders(&rows, "2026-08-01T00:00:01+00:00").await.unwrap();

        assert_eq!(store.row_count(&env(), PhaseKind::Mops).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn upsert_replaces_source_columns() {
        let store = store().await;
        store
            .upsert_planned_orders(&[mop("P1", 1)], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();

        let mut changed = mop("P1", 1);
        changed.quantity = "25".into();
        store
            .upsert_planned_orders(&[changed], "2026-08-01T00:05:00+00:00")
            .await
            .unwrap();

        let orders = store.production_orders(&env()).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quantity, "25");
    }

    #[tokio::test]
    async fn reconciler_flags_only_stale_rows() {
        let store = store().await;
        store
            .upsert_planned_orders(&[mop("P1", 1), mop("P2", 2)], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();

        // New refresh touches only P1
        store
            .upsert_planned_orders(&[mop("P1", 1)], "2026-08-01T01:00:00+00:00")
            .await
            .unwrap();

        let flagged = store
            .mark_deleted_before(&env(), PhaseKind::Mops, "2026-08-01T01:00:00+00:00")
            .await
            .unwrap();
        assert_eq!(flagged, 1);
        assert_eq!(store.row_count(&env(), PhaseKind::Mops).await.unwrap(), 1);

        // An unchanged upstream flags nothing further
        let flagged = store
            .mark_deleted_before(&env(), PhaseKind::Mops, "2026-08-01T01:00:00+00:00")
            .await
            .unwrap();
        assert_eq!(flagged, 0);
    }

    #[tokio::test]
    async fn reappearing_row_clears_deleted_flag() {
        let store = store().await;
        store
            .upsert_planned_orders(&[mop("P1", 1)], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();
        store
            .mark_deleted_before(&env(), PhaseKind::Mops, "2026-08-01T01:00:00+00:00")
            .await
            .unwrap();
        assert_eq!(store.row_count(&env(), PhaseKind::Mops).await.unwrap(), 0);

        store
            .upsert_planned_orders(&[mop("P1", 1)], "2026-08-01T02:00:00+00:00")
            .await
            .unwrap();
        assert_eq!(store.row_count(&env(), PhaseKind::Mops).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn high_water_mark_tracks_max_lmdt() {
        let store = store().await;
        assert_eq!(
            store.high_water_mark(&env(), PhaseKind::Mops).await.unwrap(),
            None
        );

        let mut a = mop("P1", 1);
        a.last_modified = "20260720".into();
        let mut b = mop("P2", 2);
        b.last_modified = "20260801".into();
        store
            .upsert_planned_orders(&[a, b], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();

        assert_eq!(
            store.high_water_mark(&env(), PhaseKind::Mops).await.unwrap(),
            Some("20260801".to_string())
        );
    }

    #[tokio::test]
    async fn environments_are_isolated() {
        let store = store().await;
        store
            .upsert_planned_orders(&[mop("P1", 1)], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();

        let other = EnvId::new("PRD").unwrap();
        assert_eq!(store.row_count(&other, PhaseKind::Mops).await.unwrap(), 0);
        assert_eq!(
            store
                .mark_deleted_before(&other, PhaseKind::Mops, "2026-08-02T00:00:00+00:00")
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn production_orders_union_both_tables() {
        let store = store().await;
        store
            .upsert_planned_orders(&[mop("P1", 1)], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();
        let mo = ManufacturingOrderRow {
            env: "TRN".into(),
            source_id: 9,
            facility: "F01".into(),
            order_number: "MO-1".into(),
            quantity: "5".into(),
            customer_order_number: "CO-1".into(),
            ..Default::default()
        };
        store
            .upsert_manufacturing_orders(&[mo], "2026-08-01T00:00:00+00:00")
            .await
            .unwrap();

        let orders = store.production_orders(&env()).await.unwrap();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().any(|o| o.kind == "MO"));
        assert!(orders.iter().any(|o| o.kind == "MOP"));
    }
}
