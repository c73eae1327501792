//! Canonical ids and lifecycle enums used across all crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Canonical Ids
// ============================================================================

/// Canonical job identifier across the system (store rowid).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<i64>()
            .map_err(|_| JobIdError::Parse(s.to_string()))?;
        Ok(JobId::new(value))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobIdError {
    #[error("invalid job id: {0}")]
    Parse(String),
}

/// Environment tag scoping every domain row (e.g. "TRN", "PRD").
///
/// Environments are fully independent: a row in one is invisible from the
/// other. The tag is uppercased on construction and restricted to short
/// ASCII alphanumerics so it can be embedded in bus subjects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EnvId(String);

impl EnvId {
    pub fn new(tag: impl AsRef<str>) -> Result<Self, EnvIdError> {
        let tag = tag.as_ref().trim().to_ascii_uppercase();
        if tag.is_empty() {
            return Err(EnvIdError::Empty);
        }
        if tag.len() > 16 || !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EnvIdError::Invalid(tag));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EnvId {
    type Err = EnvIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvIdError {
    #[error("environment tag cannot be empty")]
    Empty,
    #[error("invalid environment tag: '{0}' (expected short ASCII alphanumerics)")]
    Invalid(String),
}

// ============================================================================
// Job lifecycle
// ============================================================================

/// Kind of refresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SnapshotRefresh,
    ManualDetection,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SnapshotRefresh => "snapshot_refresh",
            JobKind::ManualDetection => "manual_detection",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot_refresh" => Ok(JobKind::SnapshotRefresh),
            "manual_detection" => Ok(JobKind::ManualDetection),
            _ => Err(format!("invalid job kind: '{s}'")),
        }
    }
}

/// Job lifecycle status. This is the CANONICAL definition - use it everywhere.
///
/// Transitions are monotonic except for retries (failed -> running).
/// Completed, failed and cancelled are terminal; a cancelled job never
/// transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// pending -> running; running -> completed | failed | cancelled;
    /// failed -> running (retry); any non-terminal -> cancelled.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        match (self, to) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Completed) => true,
            (JobStatus::Running, JobStatus::Failed) => true,
            (JobStatus::Failed, JobStatus::Running) => true,
            (from, JobStatus::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("invalid job status: '{s}'")),
        }
    }
}

// ============================================================================
// Phases
// ============================================================================

/// The three data-loading phases of a snapshot refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Planned manufacturing orders
    Mops,
    /// Manufacturing orders
    Mos,
    /// Customer order lines
    Cos,
}

impl PhaseKind {
    pub const ALL: &'static [PhaseKind] = &[PhaseKind::Mops, PhaseKind::Mos, PhaseKind::Cos];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Mops => "mops",
            PhaseKind::Mos => "mos",
            PhaseKind::Cos => "cos",
        }
    }

    /// Static table contract for this phase.
    pub fn contract(&self) -> &'static PhaseContract {
        match self {
            PhaseKind::Mops => &MOPS_CONTRACT,
            PhaseKind::Mos => &MOS_CONTRACT,
            PhaseKind::Cos => &COS_CONTRACT,
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mops" => Ok(PhaseKind::Mops),
            "mos" => Ok(PhaseKind::Mos),
            "cos" => Ok(PhaseKind::Cos),
            _ => Err(format!("invalid phase kind: '{s}'")),
        }
    }
}

/// Table contract binding a phase to its upstream source and local target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseContract {
    /// Upstream Data Fabric table
    pub source_table: &'static str,
    /// Local snapshot table
    pub local_table: &'static str,
    /// Stable numeric identity column used for id-range batching
    pub identity_column: &'static str,
    /// Upstream last-modified date column (8-digit YYYYMMDD)
    pub last_modified_column: &'static str,
    /// Whether a crashed phase can resume its unfinished batches.
    /// Non-resumable phases are reloaded whole and reconciled afterwards.
    pub resumable: bool,
    /// Reference lookup kinds the enricher resolves for this phase's rows
    pub reference_lookups: &'static [&'static str],
}

static MOPS_CONTRACT: PhaseContract = PhaseContract {
    source_table: "MMOPLP",
    local_table: "mr_planned_orders",
    identity_column: "PLPN",
    last_modified_column: "LMDT",
    resumable: true,
    reference_lookups: &["order_type", "item"],
};

static MOS_CONTRACT: PhaseContract = PhaseContract {
    source_table: "MWOHED",
    local_table: "mr_manufacturing_orders",
    identity_column: "MOID",
    last_modified_column: "LMDT",
    resumable: true,
    reference_lookups: &["order_type", "item"],
};

static COS_CONTRACT: PhaseContract = PhaseContract {
    source_table: "OOLINE",
    local_table: "mr_customer_order_lines",
    identity_column: "OLID",
    last_modified_column: "LMDT",
    resumable: false,
    reference_lookups: &["order_type", "customer", "delivery_method", "item"],
};

/// Phase lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Cancelled
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "running" => Ok(PhaseStatus::Running),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            "cancelled" => Ok(PhaseStatus::Cancelled),
            _ => Err(format!("invalid phase status: '{s}'")),
        }
    }
}

// ============================================================================
// Detector runs
// ============================================================================

/// Detector run lifecycle status.
///
/// Skipped is terminal and means a declared dependency failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectorStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl DetectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorStatus::Pending => "pending",
            DetectorStatus::Running => "running",
            DetectorStatus::Completed => "completed",
            DetectorStatus::Failed => "failed",
            DetectorStatus::Skipped => "skipped",
            DetectorStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DetectorStatus::Completed
                | DetectorStatus::Failed
                | DetectorStatus::Skipped
                | DetectorStatus::Cancelled
        )
    }
}

impl fmt::Display for DetectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DetectorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DetectorStatus::Pending),
            "running" => Ok(DetectorStatus::Running),
            "completed" => Ok(DetectorStatus::Completed),
            "failed" => Ok(DetectorStatus::Failed),
            "skipped" => Ok(DetectorStatus::Skipped),
            "cancelled" => Ok(DetectorStatus::Cancelled),
            _ => Err(format!("invalid detector status: '{s}'")),
        }
    }
}

// ============================================================================
// Issues & alerts
// ============================================================================

/// Which production-order table an issue points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductionOrderType {
    #[serde(rename = "MO")]
    Mo,
    #[serde(rename = "MOP")]
    Mop,
}

impl ProductionOrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductionOrderType::Mo => "MO",
            ProductionOrderType::Mop => "MOP",
        }
    }
}

impl fmt::Display for ProductionOrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProductionOrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MO" => Ok(ProductionOrderType::Mo),
            "MOP" => Ok(ProductionOrderType::Mop),
            _ => Err(format!("invalid production order type: '{s}'")),
        }
    }
}

/// Issue / alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("invalid severity: '{s}'")),
        }
    }
}

/// Anomaly alert lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    #[default]
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            _ => Err(format!("invalid alert status: '{s}'")),
        }
    }
}

/// Entity an anomaly alert is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEntity {
    Product,
    Warehouse,
    System,
}

impl AlertEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEntity::Product => "product",
            AlertEntity::Warehouse => "warehouse",
            AlertEntity::System => "system",
        }
    }
}

impl FromStr for AlertEntity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(AlertEntity::Product),
            "warehouse" => Ok(AlertEntity::Warehouse),
            "system" => Ok(AlertEntity::System),
            _ => Err(format!("invalid alert entity: '{s}'")),
        }
    }
}

// TryFrom<String> mirrors FromStr so sqlx row mapping can use
// `#[sqlx(try_from = "String")]` on status columns.
macro_rules! try_from_string {
    ($($ty:ty),* $(,)?) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = String;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }
        )*
    };
}

try_from_string!(
    JobKind,
    JobStatus,
    PhaseKind,
    PhaseStatus,
    DetectorStatus,
    ProductionOrderType,
    Severity,
    AlertStatus,
    AlertEntity,
);

impl TryFrom<String> for EnvId {
    type Error = EnvIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_id_normalizes_and_validates() {
        assert_eq!(EnvId::new(" trn ").unwrap().as_str(), "TRN");
        assert!(EnvId::new("").is_err());
        assert!(EnvId::new("bad.tag").is_err());
        assert!(EnvId::new("WAYTOOLONGENVIRONMENT").is_err());
    }

    #[test]
    fn job_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(Failed.can_transition(Running));
        assert!(Pending.can_transition(Cancelled));
        assert!(Running.can_transition(Cancelled));
        assert!(Failed.can_transition(Cancelled));

        assert!(!Completed.can_transition(Running));
        assert!(!Cancelled.can_transition(Running));
        assert!(!Cancelled.can_transition(Cancelled));
        assert!(!Pending.can_transition(Completed));
    }

    #[test]
    fn phase_contracts_cover_all_kinds() {
        for kind in PhaseKind::ALL {
            let contract = kind.contract();
            assert!(!contract.source_table.is_empty());
            assert!(contract.local_table.starts_with("mr_"));
        }
        assert!(!PhaseKind::Cos.contract().resumable);
        assert!(PhaseKind::Mops.contract().resumable);
    }

    #[test]
    fn status_round_trips() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), *status);
        }
    }
}
