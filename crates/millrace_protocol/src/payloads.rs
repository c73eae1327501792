//! Bus message payloads.
//!
//! Every message that crosses a subject is one of these serde types.
//! Payloads are JSON on the wire; unknown fields are ignored so the core
//! tolerates additive changes from the gateway side.

use crate::types::{EnvId, JobId, JobStatus, PhaseKind};
use serde::{Deserialize, Serialize};

/// Options carried by a refresh request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Reload every phase whole, ignoring the high-water-mark cutoff.
    /// An explicit full refresh always wins over the incremental cutoff.
    #[serde(default)]
    pub full_refresh: bool,
}

/// Inbound request to start a snapshot refresh (`snapshot.refresh.<ENV>`).
///
/// The job row is created in `pending` by the gateway before the request is
/// published; the orchestrator picks it up from there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshRequest {
    pub job_id: JobId,
    pub env: EnvId,
    #[serde(default)]
    pub options: RefreshOptions,
}

/// One id-range slice of a phase, processed by exactly one batch worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub job_id: JobId,
    pub env: EnvId,
    pub phase: PhaseKind,
    pub batch_index: u32,
    /// Inclusive lower bound of the upstream identity range.
    pub id_low: i64,
    /// Exclusive upper bound of the upstream identity range.
    pub id_high: i64,
    pub full_refresh: bool,
    /// Incremental cutoff fixed at planning time: only rows with
    /// last-modified at or above this value are fetched. None on a full
    /// refresh. Snapshotting it here keeps re-driven batches identical and
    /// stops later batches from seeing marks written by earlier ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<String>,
}

/// Worker -> orchestrator batch outcome (`snapshot.batch.complete.<JOB>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchComplete {
    pub job_id: JobId,
    pub phase: PhaseKind,
    pub batch_index: u32,
    pub record_count: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Orchestrator-internal phase outcome (`snapshot.phase.complete.<JOB>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseComplete {
    pub job_id: JobId,
    pub phase: PhaseKind,
    pub record_count: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-entity record counters carried by progress events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordCounters {
    pub mops_processed: u64,
    pub mos_processed: u64,
    pub co_lines_processed: u64,
}

impl RecordCounters {
    pub fn total(&self) -> u64 {
        self.mops_processed + self.mos_processed + self.co_lines_processed
    }
}

/// Throttled progress snapshot for the SSE bridge
/// (`snapshot.progress.<JOB>` / `analysis.progress.<JOB>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub env: EnvId,
    pub status: JobStatus,
    pub step: u32,
    pub total_steps: u32,
    pub current_operation: String,
    pub records_per_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub current_batch: u32,
    pub total_batches: u32,
    #[serde(default)]
    pub counters: RecordCounters,
}

/// Terminal success event (`snapshot.complete.<JOB>` /
/// `analysis.complete.<JOB>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobComplete {
    pub job_id: JobId,
    pub env: EnvId,
    #[serde(default)]
    pub counters: RecordCounters,
    pub issues_found: u64,
}

/// Terminal failure event (`snapshot.error.<JOB>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub job_id: JobId,
    pub env: EnvId,
    /// Short user-safe message; structured detail goes to the logs only.
    pub message: String,
}

/// Inbound request to run detectors without a refresh (`analysis.run`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub env: EnvId,
    /// Restrict to these detectors; empty means all enabled detectors.
    #[serde(default)]
    pub detectors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_request_round_trip() {
        let req = RefreshRequest {
            job_id: JobId::new(42),
            env: EnvId::new("TRN").unwrap(),
            options: RefreshOptions { full_refresh: true },
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: RefreshRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn refresh_options_default_when_missing() {
        let req: RefreshRequest =
            serde_json::from_str(r#"{"job_id": 1, "env": "PRD"}"#).unwrap();
        assert!(!req.options.full_refresh);
    }

    #[test]
    fn batch_complete_omits_absent_error() {
        let msg = BatchComplete {
            job_id: JobId::new(1),
            phase: PhaseKind::Mos,
            batch_index: 0,
            record_count: 10,
            ok: true,
            error: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("error"));
    }
}
