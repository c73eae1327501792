//! Shared protocol surface for the Millrace snapshot platform.
//!
//! Everything that crosses a crate boundary lives here: canonical ids and
//! status enums, the bus subject grammar, message payloads, default values
//! and the setting-key catalogue. Components never invent their own copies
//! of these - this crate is the single source of truth.

pub mod defaults;
pub mod payloads;
pub mod settings;
pub mod subjects;
pub mod types;

// Re-export the canonical enums and ids for convenience
pub use payloads::{
    AnalysisRequest, BatchComplete, BatchDescriptor, JobComplete, JobError, PhaseComplete,
    ProgressEvent, RecordCounters, RefreshOptions, RefreshRequest,
};
pub use types::{
    AlertEntity, AlertStatus, DetectorStatus, EnvId, EnvIdError, JobId, JobIdError, JobKind,
    JobStatus, PhaseContract, PhaseKind, PhaseStatus, ProductionOrderType, Severity,
};
