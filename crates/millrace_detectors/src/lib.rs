//! Detector suite for the planning snapshot.
//!
//! A detector is a deterministic function from a snapshot to a set of
//! issues or anomaly alerts. The catalogue is static data
//! ([`registry::REGISTRY`]); execution is a uniform dispatch so the runner
//! can build a dependency DAG and run waves in parallel without knowing any
//! detector's internals.

pub mod anomaly;
pub mod dates;
pub mod registry;
pub mod rules;
pub mod runner;

pub use registry::{DetectorKind, DetectorSpec, REGISTRY};
pub use runner::DetectorRunner;

use millrace_protocol::{EnvId, JobId};
use millrace_store::{CandidateAlert, CandidateIssue, ConfigResolver, SnapshotStore};

/// Everything a detector may touch. Settings are read through the resolver
/// at execution start, so one detector sees one consistent configuration.
pub struct DetectorContext<'a> {
    pub env: &'a EnvId,
    pub job_id: JobId,
    pub snapshots: &'a SnapshotStore,
    pub config: &'a ConfigResolver,
}

/// Outcome of one detector execution.
#[derive(Debug, Default)]
pub struct DetectorOutput {
    pub issues: Vec<CandidateIssue>,
    pub alerts: Vec<CandidateAlert>,
}

impl DetectorOutput {
    pub fn issues(issues: Vec<CandidateIssue>) -> Self {
        Self {
            issues,
            alerts: Vec::new(),
        }
    }

    pub fn alerts(alerts: Vec<CandidateAlert>) -> Self {
        Self {
            issues: Vec::new(),
            alerts,
        }
    }

    pub fn count(&self) -> u64 {
        (self.issues.len() + self.alerts.len()) as u64
    }
}
