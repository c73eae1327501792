//! Row models for the store.
//!
//! FromRow derives map database rows to structs; status columns decode
//! through the canonical protocol enums via `try_from`.

use chrono::{DateTime, Utc};
use millrace_protocol::{
    AlertEntity, AlertStatus, DetectorStatus, EnvId, JobId, JobKind, JobStatus, PhaseKind,
    PhaseStatus, ProductionOrderType, Severity,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Jobs
// ============================================================================

/// A single refresh or manual-detection run.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub env: EnvId,
    #[sqlx(try_from = "String")]
    pub kind: JobKind,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub current_step: i64,
    pub total_steps: i64,
    pub current_operation: Option<String>,
    pub records_per_sec: f64,
    pub eta_seconds: Option<i64>,
    pub current_batch: i64,
    pub total_batches: i64,
    pub mops_processed: i64,
    pub mos_processed: i64,
    pub co_lines_processed: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    pub fn job_id(&self) -> JobId {
        JobId::new(self.id)
    }

    pub fn started_at_utc(&self) -> Option<DateTime<Utc>> {
        self.started_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// One data-loading phase of a job; the unit of crash recovery.
#[derive(Debug, Clone, FromRow)]
pub struct JobPhase {
    pub id: i64,
    pub job_id: i64,
    #[sqlx(try_from = "String")]
    pub kind: PhaseKind,
    #[sqlx(try_from = "String")]
    pub status: PhaseStatus,
    pub record_count: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Tracking record for one detector execution within a job.
#[derive(Debug, Clone, FromRow)]
pub struct DetectorRun {
    pub id: i64,
    pub job_id: i64,
    pub detector: String,
    #[sqlx(try_from = "String")]
    pub status: DetectorStatus,
    pub issues_found: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
}

// ============================================================================
// Detection output
// ============================================================================

/// A stored detected issue.
#[derive(Debug, Clone, FromRow)]
pub struct DetectedIssue {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub env: EnvId,
    pub job_id: i64,
    pub detector_type: String,
    pub detected_at: String,
    pub facility: String,
    pub warehouse: String,
    pub issue_key: String,
    pub production_order_number: String,
    pub production_order_type: Option<String>,
    pub customer_order_number: String,
    pub customer_order_line: String,
    pub customer_order_suffix: String,
    pub issue_data: Option<String>,
    #[sqlx(try_from = "String")]
    pub severity: Severity,
}

impl DetectedIssue {
    pub fn production_order_type(&self) -> Option<ProductionOrderType> {
        self.production_order_type.as_deref()?.parse().ok()
    }
}

/// A detector's candidate issue, before ignored-issue filtering and storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateIssue {
    pub facility: String,
    pub warehouse: String,
    pub issue_key: String,
    pub production_order_number: String,
    pub production_order_type: Option<ProductionOrderType>,
    pub customer_order_number: String,
    pub customer_order_line: String,
    pub customer_order_suffix: String,
    pub issue_data: serde_json::Value,
    pub severity: Severity,
}

impl CandidateIssue {
    /// Minimal issue pointing at a production order.
    pub fn for_production_order(
        facility: impl Into<String>,
        issue_key: impl Into<String>,
        order_number: impl Into<String>,
        order_type: ProductionOrderType,
    ) -> Self {
        let order_number = order_number.into();
        Self {
            facility: facility.into(),
            warehouse: String::new(),
            issue_key: issue_key.into(),
            production_order_number: order_number,
            production_order_type: Some(order_type),
            customer_order_number: String::new(),
            customer_order_line: String::new(),
            customer_order_suffix: String::new(),
            issue_data: serde_json::Value::Null,
            severity: Severity::Info,
        }
    }
}

/// A stored anomaly alert.
#[derive(Debug, Clone, FromRow)]
pub struct AnomalyAlert {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub env: EnvId,
    pub job_id: i64,
    pub detector_type: String,
    #[sqlx(try_from = "String")]
    pub severity: Severity,
    #[sqlx(try_from = "String")]
    pub entity_type: AlertEntity,
    pub entity_id: String,
    pub message: String,
    pub metrics: Option<String>,
    pub affected_count: i64,
    pub threshold_value: f64,
    pub actual_value: f64,
    #[sqlx(try_from = "String")]
    pub status: AlertStatus,
    pub created_at: String,
    pub acknowledged_at: Option<String>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
}

/// An anomaly detector's candidate alert, before storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateAlert {
    pub severity: Severity,
    pub entity_type: AlertEntity,
    pub entity_id: String,
    pub message: String,
    pub metrics: serde_json::Value,
    pub affected_count: u64,
    pub threshold_value: f64,
    pub actual_value: f64,
}

/// A user decision to suppress an issue.
#[derive(Debug, Clone, FromRow)]
pub struct IgnoredIssue {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub env: EnvId,
    pub facility: String,
    pub detector_type: String,
    pub issue_key: String,
    pub production_order_number: String,
    pub created_by: Option<String>,
    pub created_at: String,
}

// ============================================================================
// Settings
// ============================================================================

/// One (env, key) setting row.
#[derive(Debug, Clone, FromRow)]
pub struct Setting {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub env: EnvId,
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub constraints: Option<String>,
    pub category: Option<String>,
    pub updated_by: Option<String>,
    pub updated_at: String,
}
