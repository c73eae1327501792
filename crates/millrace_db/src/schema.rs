//! Database schema creation for all Millrace tables.
//!
//! All CREATE TABLE statements live here - single source of truth.
//! Every domain table carries an `env` column; uniqueness and joins are
//! always scoped by it.

use crate::error::Result;
use crate::MillraceDb;
use tracing::info;

impl MillraceDb {
    /// Ensure all tables exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.create_job_tables().await?;
        self.create_snapshot_tables().await?;
        self.create_detection_tables().await?;
        self.create_config_tables().await?;

        info!("Database schema verified");
        Ok(())
    }

    /// Job, phase and detector-run tracking.
    async fn create_job_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                env TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                current_step INTEGER NOT NULL DEFAULT 0,
                total_steps INTEGER NOT NULL DEFAULT 0,
                current_operation TEXT,
                records_per_sec REAL NOT NULL DEFAULT 0,
                eta_seconds INTEGER,
                current_batch INTEGER NOT NULL DEFAULT 0,
                total_batches INTEGER NOT NULL DEFAULT 0,
                mops_processed INTEGER NOT NULL DEFAULT 0,
                mos_processed INTEGER NOT NULL DEFAULT 0,
                co_lines_processed INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 2,
                error_message TEXT,
                started_at TEXT,
                completed_at TEXT,
                duration_ms INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_jobs_env_status
               ON mr_jobs (env, status)"#,
        )
        .execute(self.pool())
        .await?;

        // Phases: the unit of crash recovery
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_job_phases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES mr_jobs(id),
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                record_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                started_at TEXT,
                completed_at TEXT,
                duration_ms INTEGER,
                UNIQUE (job_id, kind)
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_detector_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES mr_jobs(id),
                detector TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                issues_found INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                started_at TEXT,
                completed_at TEXT,
                duration_ms INTEGER,
                UNIQUE (job_id, detector)
            )"#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Harvested snapshot tables. All upstream scalars are TEXT to preserve
    /// the source representation exactly; dates are 8-digit YYYYMMDD text.
    async fn create_snapshot_tables(&self) -> Result<()> {
        // Planned manufacturing orders (MOPs)
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_planned_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                env TEXT NOT NULL,
                source_id INTEGER NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                facility TEXT NOT NULL DEFAULT '',
                warehouse TEXT NOT NULL DEFAULT '',
                plan_number TEXT NOT NULL,
                product TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                order_type TEXT NOT NULL DEFAULT '',
                quantity TEXT NOT NULL DEFAULT '0',
                entry_date TEXT NOT NULL DEFAULT '',
                start_date TEXT NOT NULL DEFAULT '',
                finish_date TEXT NOT NULL DEFAULT '',
                customer_order_number TEXT NOT NULL DEFAULT '',
                customer_order_line TEXT NOT NULL DEFAULT '',
                customer_order_suffix TEXT NOT NULL DEFAULT '',
                attributes TEXT,
                last_modified TEXT NOT NULL DEFAULT '',
                order_type_description TEXT,
                item_description TEXT,
                deleted_remotely INTEGER NOT NULL DEFAULT 0,
                sync_timestamp TEXT NOT NULL,
                UNIQUE (env, facility, plan_number)
            )"#,
        )
        .execute(self.pool())
        .await?;

        // Manufacturing orders (MOs)
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_manufacturing_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                env TEXT NOT NULL,
                source_id INTEGER NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                facility TEXT NOT NULL DEFAULT '',
                warehouse TEXT NOT NULL DEFAULT '',
                order_number TEXT NOT NULL,
                product TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                order_type TEXT NOT NULL DEFAULT '',
                quantity TEXT NOT NULL DEFAULT '0',
                put_away_quantity TEXT NOT NULL DEFAULT '0',
                entry_date TEXT NOT NULL DEFAULT '',
                start_date TEXT NOT NULL DEFAULT '',
                finish_date TEXT NOT NULL DEFAULT '',
                customer_order_number TEXT NOT NULL DEFAULT '',
                customer_order_line TEXT NOT NULL DEFAULT '',
                customer_order_suffix TEXT NOT NULL DEFAULT '',
                attributes TEXT,
                last_modified TEXT NOT NULL DEFAULT '',
                order_type_description TEXT,
                item_description TEXT,
                deleted_remotely INTEGER NOT NULL DEFAULT 0,
                sync_timestamp TEXT NOT NULL,
                UNIQUE (env, facility, order_number)
            )"#,
        )
        .execute(self.pool())
        .await?;

        // Customer order lines (COs)
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_customer_order_lines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                env TEXT NOT NULL,
                source_id INTEGER NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                facility TEXT NOT NULL DEFAULT '',
                warehouse TEXT NOT NULL DEFAULT '',
                order_number TEXT NOT NULL,
                line_number TEXT NOT NULL,
                line_suffix TEXT NOT NULL DEFAULT '',
                item TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                order_type TEXT NOT NULL DEFAULT '',
                quantity TEXT NOT NULL DEFAULT '0',
                remaining_quantity TEXT NOT NULL DEFAULT '0',
                joint_delivery TEXT NOT NULL DEFAULT '',
                delivery_number TEXT NOT NULL DEFAULT '',
                delivery_method TEXT NOT NULL DEFAULT '',
                customer TEXT NOT NULL DEFAULT '',
                requested_delivery_date TEXT NOT NULL DEFAULT '',
                confirmed_delivery_date TEXT NOT NULL DEFAULT '',
                attributes TEXT,
                last_modified TEXT NOT NULL DEFAULT '',
                order_type_description TEXT,
                customer_name TEXT,
                delivery_method_description TEXT,
                item_description TEXT,
                deleted_remotely INTEGER NOT NULL DEFAULT 0,
                sync_timestamp TEXT NOT NULL,
                UNIQUE (env, order_number, line_number, line_suffix)
            )"#,
        )
        .execute(self.pool())
        .await?;

        // Linkage lookups used by every detector
        for stmt in [
            r#"CREATE INDEX IF NOT EXISTS idx_mops_co_link
               ON mr_planned_orders (env, customer_order_number)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_mos_co_link
               ON mr_manufacturing_orders (env, customer_order_number)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_cos_sync
               ON mr_customer_order_lines (env, sync_timestamp)"#,
        ] {
            sqlx::query(stmt).execute(self.pool()).await?;
        }

        Ok(())
    }

    /// Detected issues, anomaly alerts and user suppressions.
    async fn create_detection_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_detected_issues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                env TEXT NOT NULL,
                job_id INTEGER NOT NULL,
                detector_type TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                facility TEXT NOT NULL DEFAULT '',
                warehouse TEXT NOT NULL DEFAULT '',
                issue_key TEXT NOT NULL,
                production_order_number TEXT NOT NULL DEFAULT '',
                production_order_type TEXT,
                customer_order_number TEXT NOT NULL DEFAULT '',
                customer_order_line TEXT NOT NULL DEFAULT '',
                customer_order_suffix TEXT NOT NULL DEFAULT '',
                issue_data TEXT,
                severity TEXT NOT NULL DEFAULT 'info'
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_issues_scope
               ON mr_detected_issues (env, detector_type, job_id)"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_anomaly_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                env TEXT NOT NULL,
                job_id INTEGER NOT NULL,
                detector_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                message TEXT NOT NULL,
                metrics TEXT,
                affected_count INTEGER NOT NULL DEFAULT 0,
                threshold_value REAL NOT NULL DEFAULT 0,
                actual_value REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                acknowledged_at TEXT,
                acknowledged_by TEXT,
                resolved_at TEXT,
                resolved_by TEXT
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_ignored_issues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                env TEXT NOT NULL,
                facility TEXT NOT NULL DEFAULT '',
                detector_type TEXT NOT NULL,
                issue_key TEXT NOT NULL,
                production_order_number TEXT NOT NULL DEFAULT '',
                created_by TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (env, facility, detector_type, issue_key, production_order_number)
            )"#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Settings and the reference-data cache.
    async fn create_config_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                env TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                value_type TEXT NOT NULL DEFAULT 'string',
                constraints TEXT,
                category TEXT,
                updated_by TEXT,
                updated_at TEXT NOT NULL,
                UNIQUE (env, key)
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS mr_reference_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                env TEXT NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                code TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                expires_at TEXT NOT NULL,
                UNIQUE (env, company, kind, code)
            )"#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
