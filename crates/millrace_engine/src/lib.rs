//! Refresh engine: end-to-end coordination of a snapshot refresh.
//!
//! Data flow, leaves first: rate limiter -> fabric client -> batch worker
//! (writes snapshot rows, publishes batch-complete) -> orchestrator fan-in
//! -> reconciler -> enricher -> detector pipeline. The job store is called
//! from every component for state; the progress publisher is a sink
//! consuming deltas. No component holds a store transaction across an
//! upstream call.

pub mod cancel;
pub mod context;
pub mod enrich;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod reconcile;
pub mod sql;
pub mod worker;

pub use cancel::{spawn_cancel_listener, CancelFlag, CancelRegistry};
pub use context::{DetectionSummary, DetectorPipeline, EngineContext};
pub use orchestrator::Orchestrator;
pub use progress::{spawn_progress_publisher, ProgressSender, ProgressUpdate};
pub use worker::BatchWorkerPool;
