//! Detected issues, anomaly alerts and ignored-issue suppressions.
//!
//! Issue storage is replace-on-run: the stored set for a run scope always
//! equals the detector's latest output minus ignored issues. Replacement is
//! total, not incremental - delete-then-insert inside one transaction.

use millrace_db::{MillraceDb, Result};
use millrace_protocol::{EnvId, JobId};
use sqlx::SqlitePool;
use std::collections::HashSet;

use crate::models::{AnomalyAlert, CandidateAlert, CandidateIssue, DetectedIssue, IgnoredIssue};
use crate::now_rfc3339;

/// Scope of the delete half of a replace. Refresh jobs own their rows;
/// manual-detection jobs supersede every earlier run of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceScope {
    /// Delete rows of (env, detector_type, job_id) only.
    ThisJob,
    /// Delete all rows of (env, detector_type) regardless of job.
    AllJobs,
}

/// Detected-issue persistence.
#[derive(Clone)]
pub struct IssueStore {
    pool: SqlitePool,
}

impl IssueStore {
    pub fn new(db: &MillraceDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Atomically replace stored issues for a run.
    pub async fn replace_for_run(
        &self,
        env: &EnvId,
        detector_type: &str,
        job_id: JobId,
        scope: ReplaceScope,
        issues: &[CandidateIssue],
    ) -> Result<u64> {
        let now = now_rfc3339();
        let mut tx = self.pool.begin().await?;

        match scope {
            ReplaceScope::ThisJob => {
                sqlx::query(
                    "DELETE FROM mr_detected_issues WHERE env = ? AND detector_type = ? AND job_id = ?",
                )
                .bind(env.as_str())
                .bind(detector_type)
                .bind(job_id.as_i64())
                .execute(&mut *tx)
                .await?;
            }
            ReplaceScope::AllJobs => {
                sqlx::query("DELETE FROM mr_detected_issues WHERE env = ? AND detector_type = ?")
                    .bind(env.as_str())
                    .bind(detector_type)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for issue in issues {
            sqlx::query(
                r#"
                INSERT INTO mr_detected_issues (
                    env, job_id, detector_type, detected_at, facility, warehouse,
                    issue_key, production_order_number, production_order_type,
                    customer_order_number, customer_order_line,
                    customer_order_suffix, issue_data, severity
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(env.as_str())
            .bind(job_id.as_i64())
            .bind(detector_type)
            .bind(&now)
            .bind(&issue.facility)
            .bind(&issue.warehouse)
            .bind(&issue.issue_key)
            .bind(&issue.production_order_number)
            .bind(issue.production_order_type.map(|t| t.as_str()))
            .bind(&issue.customer_order_number)
            .bind(&issue.customer_order_line)
            .bind(&issue.customer_order_suffix)
            .bind(issue.issue_data.to_string())
            .bind(issue.severity.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(issues.len() as u64)
    }

    pub async fn list(
        &self,
        env: &EnvId,
        detector_type: Option<&str>,
        job_id: Option<JobId>,
    ) -> Result<Vec<DetectedIssue>> {
        let mut sql = String::from("SELECT * FROM mr_detected_issues WHERE env = ?");
        if detector_type.is_some() {
            sql.push_str(" AND detector_type = ?");
        }
        if job_id.is_some() {
            sql.push_str(" AND job_id = ?");
        }
        sql.push_str(" ORDER BY id");

        let mut query = sqlx::query_as::<_, DetectedIssue>(&sql).bind(env.as_str());
        if let Some(detector_type) = detector_type {
            query = query.bind(detector_type);
        }
        if let Some(job_id) = job_id {
            query = query.bind(job_id.as_i64());
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    pub async fn count(&self, env: &EnvId, job_id: JobId) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mr_detected_issues WHERE env = ? AND job_id = ?")
                .bind(env.as_str())
                .bind(job_id.as_i64())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

/// Suppression key: (env, facility, detector_type, issue_key, production order).
#[derive(Clone)]
pub struct IgnoredIssueStore {
    pool: SqlitePool,
}

impl IgnoredIssueStore {
    pub fn new(db: &MillraceDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn add(
        &self,
        env: &EnvId,
        facility: &str,
        detector_type: &str,
        issue_key: &str,
        production_order_number: &str,
        created_by: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mr_ignored_issues
                (env, facility, detector_type, issue_key, production_order_number, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (env, facility, detector_type, issue_key, production_order_number)
            DO NOTHING
            "#,
        )
        .bind(env.as_str())
        .bind(facility)
        .bind(detector_type)
        .bind(issue_key)
        .bind(production_order_number)
        .bind(created_by)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(
        &self,
        env: &EnvId,
        facility: &str,
        detector_type: &str,
        issue_key: &str,
        production_order_number: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM mr_ignored_issues
            WHERE env = ? AND facility = ? AND detector_type = ?
              AND issue_key = ? AND production_order_number = ?
            "#,
        )
        .bind(env.as_str())
        .bind(facility)
        .bind(detector_type)
        .bind(issue_key)
        .bind(production_order_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all(&self, env: &EnvId) -> Result<Vec<IgnoredIssue>> {
        Ok(
            sqlx::query_as::<_, IgnoredIssue>("SELECT * FROM mr_ignored_issues WHERE env = ?")
                .bind(env.as_str())
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Suppression keys for one detector, loaded once per detector run so
    /// filtering a large candidate list never goes back to the store.
    pub async fn suppression_set(
        &self,
        env: &EnvId,
        detector_type: &str,
    ) -> Result<HashSet<(String, String, String)>> {
        let rows = sqlx::query_as::<_, IgnoredIssue>(
            "SELECT * FROM mr_ignored_issues WHERE env = ? AND detector_type = ?",
        )
        .bind(env.as_str())
        .bind(detector_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.facility, r.issue_key, r.production_order_number))
            .collect())
    }
}

/// Anomaly alert persistence with acknowledge/resolve lifecycle.
///
/// Each run replaces the still-active alerts of its detector; acknowledged
/// and resolved alerts are history and survive replacement.
#[derive(Clone)]
pub struct AlertStore {
    pool: SqlitePool,
}

impl AlertStore {
    pub fn new(db: &MillraceDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn replace_active_for_run(
        &self,
        env: &EnvId,
        detector_type: &str,
        job_id: JobId,
        alerts: &[CandidateAlert],
    ) -> Result<u64> {
        let now = now_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM mr_anomaly_alerts WHERE env = ? AND detector_type = ? AND status = 'active'",
        )
        .bind(env.as_str())
        .bind(detector_type)
        .execute(&mut *tx)
        .await?;

        for alert in alerts {
            sqlx::query(
                r#"
                INSERT INTO mr_anomaly_alerts (
                    env, job_id, detector_type, severity, entity_type, entity_id,
                    message, metrics, affected_count, threshold_value,
                    actual_value, status, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)
                "#,
            )
            .bind(env.as_str())
            .bind(job_id.as_i64())
            .bind(detector_type)
            .bind(alert.severity.as_str())
            .bind(alert.entity_type.as_str())
            .bind(&alert.entity_id)
            .bind(&alert.message)
            .bind(alert.metrics.to_string())
            .bind(alert.affected_count as i64)
            .bind(alert.threshold_value)
            .bind(alert.actual_value)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(alerts.len() as u64)
    }

    pub async fn acknowledge(&self, alert_id: i64, by: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mr_anomaly_alerts
            SET status = 'acknowledged', acknowledged_at = ?, acknowledged_by = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(now_rfc3339())
        .bind(by)
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn resolve(&self, alert_id: i64, by: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mr_anomaly_alerts
            SET status = 'resolved', resolved_at = ?, resolved_by = ?
            WHERE id = ? AND status IN ('active', 'acknowledged')
            "#,
        )
        .bind(now_rfc3339())
        .bind(by)
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_active(&self, env: &EnvId) -> Result<Vec<AnomalyAlert>> {
        Ok(sqlx::query_as::<_, AnomalyAlert>(
            "SELECT * FROM mr_anomaly_alerts WHERE env = ? AND status = 'active' ORDER BY id",
        )
        .bind(env.as_str())
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_protocol::{AlertEntity, ProductionOrderType, Severity};

    async fn db() -> MillraceDb {
        let db = MillraceDb::open_memory().await.unwrap();
        db.ensure_schema().await.unwrap();
        db
    }

    fn env() -> EnvId {
        EnvId::new("TRN").unwrap()
    }

    fn issue(key: &str) -> CandidateIssue {
        CandidateIssue::for_production_order("F01", key, key, ProductionOrderType::Mo)
    }

    #[tokio::test]
    async fn replacement_is_total_for_this_job() {
        let db = db().await;
        let store = IssueStore::new(&db);
        let job = JobId::new(1);

        store
            .replace_for_run(&env(), "unlinked_production_orders", job, ReplaceScope::ThisJob,
                &[issue("MO-1"), issue("MO-2")])
            .await
            .unwrap();
        store
            .replace_for_run(&env(), "unlinked_production_orders", job, ReplaceScope::ThisJob,
                &[issue("MO-3")])
            .await
            .unwrap();

        let stored = store
            .list(&env(), Some("unlinked_production_orders"), Some(job))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].issue_key, "MO-3");
    }

    #[tokio::test]
    async fn manual_scope_supersedes_earlier_jobs() {
        let db = db().await;
        let store = IssueStore::new(&db);

        store
            .replace_for_run(&env(), "production_timing", JobId::new(1), ReplaceScope::ThisJob,
                &[issue("MO-1")])
            .await
            .unwrap();
        store
            .replace_for_run(&env(), "production_timing", JobId::new(2), ReplaceScope::AllJobs,
                &[issue("MO-9")])
            .await
            .unwrap();

        let stored = store.list(&env(), Some("production_timing"), None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].job_id, 2);
    }

    #[tokio::test]
    async fn job_scope_keeps_other_jobs_rows() {
        let db = db().await;
        let store = IssueStore::new(&db);

        store
            .replace_for_run(&env(), "production_timing", JobId::new(1), ReplaceScope::ThisJob,
                &[issue("MO-1")])
            .await
            .unwrap();
        store
            .replace_for_run(&env(), "production_timing", JobId::new(2), ReplaceScope::ThisJob,
                &[issue("MO-2")])
            .await
            .unwrap();

        let stored = store.list(&env(), Some("production_timing"), None).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn suppression_set_round_trip() {
        let db = db().await;
        let ignored = IgnoredIssueStore::new(&db);

        ignored
            .add(&env(), "F01", "unlinked_production_orders", "MO-1001", "MO-1001", Some("ops"))
            .await
            .unwrap();
        // Duplicate add is a no-op
        ignored
            .add(&env(), "F01", "unlinked_production_orders", "MO-1001", "MO-1001", None)
            .await
            .unwrap();

        let set = ignored
            .suppression_set(&env(), "unlinked_production_orders")
            .await
            .unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&("F01".into(), "MO-1001".into(), "MO-1001".into())));

        ignored
            .remove(&env(), "F01", "unlinked_production_orders", "MO-1001", "MO-1001")
            .await
            .unwrap();
        assert!(ignored
            .suppression_set(&env(), "unlinked_production_orders")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn alerts_replace_active_but_keep_history() {
        let db = db().await;
        let alerts = AlertStore::new(&db);
        let alert = CandidateAlert {
            severity: Severity::Warning,
            entity_type: AlertEntity::Warehouse,
            entity_id: "W01".into(),
            message: "volume spike".into(),
            metrics: serde_json::json!({"volume": 1200}),
            affected_count: 12,
            threshold_value: 1000.0,
            actual_value: 1200.0,
        };

        alerts
            .replace_active_for_run(&env(), "absolute_volume", JobId::new(1), &[alert.clone()])
            .await
            .unwrap();
        let first = alerts.list_active(&env()).await.unwrap();
        assert_eq!(first.len(), 1);
        alerts.acknowledge(first[0].id, "ops").await.unwrap();

        alerts
            .replace_active_for_run(&env(), "absolute_volume", JobId::new(2), &[alert])
            .await
            .unwrap();

        // Acknowledged alert from run 1 survives, active alert is run 2's
        let active = alerts.list_active(&env()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].job_id, 2);

        let all: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mr_anomaly_alerts")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(all, 2);
    }
}
