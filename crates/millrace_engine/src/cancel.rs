//! Cooperative per-job cancellation.
//!
//! A cancel broadcast on `snapshot.cancel.<JOB>` flips the job's flag in
//! the registry; every outer loop (planner, worker paging, detector waves)
//! checks the flag between units of work and aborts at the next safe
//! boundary - between pages or between upserts, never inside one.

use millrace_bus::Bus;
use millrace_protocol::JobId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Token for cooperative cancellation of job execution.
///
/// Uses an AtomicBool internally. Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Job id -> cancel flag, shared by the orchestrator and all workers.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    flags: Arc<Mutex<HashMap<JobId, CancelFlag>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag for a job, created on first use.
    pub fn flag(&self, job_id: JobId) -> CancelFlag {
        self.flags
            .lock()
            .expect("cancel registry poisoned")
            .entry(job_id)
            .or_default()
            .clone()
    }

    /// Flip a job's flag. Safe to call for unknown jobs - the flag is
    /// created cancelled so late-arriving work observes it.
    pub fn cancel(&self, job_id: JobId) {
        self.flag(job_id).cancel();
        info!(job_id = %job_id, "cancellation requested");
    }

    /// Drop a terminal job's flag.
    pub fn remove(&self, job_id: JobId) {
        self.flags
            .lock()
            .expect("cancel registry poisoned")
            .remove(&job_id);
    }
}

/// Listen for cancel broadcasts and flip registry flags. The job id is the
/// final subject token.
pub fn spawn_cancel_listener(bus: &Bus, registry: CancelRegistry) -> JoinHandle<()> {
    let mut sub = bus
        .subscribe("snapshot.cancel.>")
        .expect("static pattern is valid");
    tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            match msg.subject.rsplit('.').next().and_then(|t| t.parse::<JobId>().ok()) {
                Some(job_id) => registry.cancel(job_id),
                None => warn!(subject = %msg.subject, "cancel broadcast without job id"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_is_shared_across_clones() {
        let registry = CancelRegistry::new();
        let flag = registry.flag(JobId::new(1));
        assert!(!flag.is_cancelled());

        registry.cancel(JobId::new(1));
        assert!(flag.is_cancelled());

        // Unknown jobs get a pre-cancelled flag
        registry.cancel(JobId::new(2));
        assert!(registry.flag(JobId::new(2)).is_cancelled());
    }

    #[tokio::test]
    async fn listener_flips_flag_from_broadcast() {
        let bus = Bus::new();
        let registry = CancelRegistry::new();
        let handle = spawn_cancel_listener(&bus, registry.clone());

        bus.publish("snapshot.cancel.42", &serde_json::json!({})).unwrap();

        // Give the listener task a turn
        for _ in 0..10 {
            if registry.flag(JobId::new(42)).is_cancelled() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(registry.flag(JobId::new(42)).is_cancelled());
        handle.abort();
    }
}
