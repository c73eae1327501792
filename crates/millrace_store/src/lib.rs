//! Repositories over the Millrace snapshot store.
//!
//! Each repository owns a pool handle and speaks SQL for exactly one slice
//! of the schema. Components receive repositories, never raw pools. The job
//! manager ([`jobs::JobStore`]) is the only authority on user-visible job
//! status.

pub mod issues;
pub mod jobs;
pub mod models;
pub mod reference;
pub mod settings;
pub mod snapshot;

pub use issues::{AlertStore, IgnoredIssueStore, IssueStore, ReplaceScope};
pub use jobs::{DetectorPatch, JobFilter, JobStore, PhasePatch, ProgressPatch};
pub use models::{
    AnomalyAlert, CandidateAlert, CandidateIssue, DetectedIssue, DetectorRun, IgnoredIssue, Job,
    JobPhase, Setting,
};
pub use reference::ReferenceCache;
pub use settings::{ConfigResolver, SettingType, SettingsStore, ThresholdScope};
pub use snapshot::{
    CustomerOrderLineRow, ManufacturingOrderRow, OrderEnrichmentRow, PlannedOrderRow,
    SnapshotStore,
};

/// RFC 3339 timestamp of now at millisecond precision - the canonical text
/// instant everywhere in the store. One rendering keeps lexicographic
/// comparisons and SQLite's date functions agreeing with wall-clock order.
pub fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, false)
}
