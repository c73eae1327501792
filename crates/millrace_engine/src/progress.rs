//! Throttled progress publication.
//!
//! Workers and the orchestrator send deltas over a channel; the publisher
//! task coalesces them per job at >= 100 ms, smooths records/sec with an
//! EWMA over the last ~10 s, derives a capped ETA and publishes a snapshot
//! to the per-job progress subject for the SSE bridge. The same snapshot is
//! mirrored into the job store; storage failures there are logged and
//! swallowed - progress is advisory and never gates correctness.

use millrace_bus::Bus;
use millrace_protocol::{
    defaults, subjects, EnvId, JobId, JobKind, JobStatus, PhaseKind, ProgressEvent, RecordCounters,
};
use millrace_store::{JobStore, ProgressPatch};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, warn};

/// A progress delta from a worker or the orchestrator.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    /// A job entered the pipeline; fixes the subject family and counters.
    Started {
        job_id: JobId,
        env: EnvId,
        kind: JobKind,
        total_steps: u32,
    },
    /// Records upserted for a phase.
    Records {
        job_id: JobId,
        phase: PhaseKind,
        delta: u64,
    },
    /// Expected total records, from planner row estimates (drives ETA).
    Expected { job_id: JobId, total: u64 },
    /// Step / operation change.
    Operation {
        job_id: JobId,
        step: u32,
        description: String,
    },
    /// Batch counters.
    Batches {
        job_id: JobId,
        completed_delta: u32,
        total: Option<u32>,
    },
    /// Job left the pipeline; flushes the final snapshot.
    Finished { job_id: JobId, status: JobStatus },
}

impl ProgressUpdate {
    fn job_id(&self) -> JobId {
        match self {
            ProgressUpdate::Started { job_id, .. }
            | ProgressUpdate::Records { job_id, .. }
            | ProgressUpdate::Expected { job_id, .. }
            | ProgressUpdate::Operation { job_id, .. }
            | ProgressUpdate::Batches { job_id, .. }
            | ProgressUpdate::Finished { job_id, .. } => *job_id,
        }
    }
}

/// Sending half handed to every component. Sends never block and never
/// fail the caller: a closed publisher just drops deltas.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSender {
    pub fn send(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }
}

struct JobProgress {
    env: EnvId,
    kind: JobKind,
    status: JobStatus,
    step: u32,
    total_steps: u32,
    operation: String,
    counters: RecordCounters,
    expected_total: u64,
    current_batch: u32,
    total_batches: u32,
    rate: f64,
    last_rate_update: Instant,
    last_published: Option<Instant>,
    dirty: bool,
}

impl JobProgress {
    fn new(env: EnvId, kind: JobKind, total_steps: u32) -> Self {
        Self {
            env,
            kind,
            status: JobStatus::Running,
            step: 0,
            total_steps,
            operation: String::new(),
            counters: RecordCounters::default(),
            expected_total: 0,
            current_batch: 0,
            total_batches: 0,
            rate: 0.0,
            last_rate_update: Instant::now(),
            last_published: None,
            dirty: true,
        }
    }

    /// Fold a record delta into the EWMA. alpha = dt / window, so a burst
    /// of deltas inside one window decays smoothly.
    fn observe_records(&mut self, delta: u64) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_rate_update).as_secs_f64();
        self.last_rate_update = now;
        let window = defaults::PROGRESS_RATE_WINDOW_SECS as f64;
        if dt > 0.0 {
            let instantaneous = delta as f64 / dt;
            let alpha = (dt / window).min(1.0);
            self.rate = self.rate * (1.0 - alpha) + instantaneous * alpha;
        }
    }

    fn eta_seconds(&self) -> Option<u64> {
        if self.rate <= 0.01 || self.expected_total == 0 {
            return None;
        }
        let done = self.counters.total();
        let remaining = self.expected_total.saturating_sub(done);
        let eta = (remaining as f64 / self.rate) as u64;
        Some(eta.min(defaults::MAX_ETA_SECS))
    }

    fn snapshot(&self, job_id: JobId) -> ProgressEvent {
        ProgressEvent {
            job_id,
            env: self.env.clone(),
            status: self.status,
            step: self.step,
            total_steps: self.total_steps,
            current_operation: self.operation.clone(),
            records_per_sec: (self.rate * 10.0).round() / 10.0,
            eta_seconds: self.eta_seconds(),
            current_batch: self.current_batch,
            total_batches: self.total_batches,
            counters: self.counters,
        }
    }
}

/// Spawn the coalescing publisher task. Returns the sender and the task
/// handle; drop every sender clone to stop the task.
pub fn spawn_progress_publisher(
    bus: Bus,
    jobs: JobStore,
) -> (ProgressSender, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(publisher_loop(bus, jobs, rx));
    (ProgressSender { tx }, handle)
}

async fn publisher_loop(
    bus: Bus,
    jobs: JobStore,
    mut rx: mpsc::UnboundedReceiver<ProgressUpdate>,
) {
    let mut states: HashMap<JobId, JobProgress> = HashMap::new();
    let mut tick = interval(Duration::from_millis(defaults::PROGRESS_COALESCE_MS));

    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else { break };
                let job_id = update.job_id();
                apply_update(&mut states, update);
                // Terminal updates flush immediately
                if let Some(state) = states.get_mut(&job_id) {
                    if state.status.is_terminal() {
                        publish(&bus, &jobs, job_id, state).await;
                        states.remove(&job_id);
                    }
                }
            }
            _ = tick.tick() => {
                for (job_id, state) in states.iter_mut() {
                    let due = state
                        .last_published
                        .map(|t| t.elapsed() >= Duration::from_millis(defaults::PROGRESS_COALESCE_MS))
                        .unwrap_or(true);
                    if state.dirty && due {
                        publish(&bus, &jobs, *job_id, state).await;
                    }
                }
            }
        }
    }
}

fn apply_update(states: &mut HashMap<JobId, JobProgress>, update: ProgressUpdate) {
    match update {
        ProgressUpdate::Started {
            job_id,
            env,
            kind,
            total_steps,
        } => {
            states.insert(job_id, JobProgress::new(env, kind, total_steps));
        }
        ProgressUpdate::Records { job_id, phase, delta } => {
            if let Some(state) = states.get_mut(&job_id) {
                match phase {
                    PhaseKind::Mops => state.counters.mops_processed += delta,
                    PhaseKind::Mos => state.counters.mos_processed += delta,
                    PhaseKind::Cos => state.counters.co_lines_processed += delta,
                }
                state.observe_records(delta);
                state.dirty = true;
            }
        }
        ProgressUpdate::Expected { job_id, total } => {
            if let Some(state) = states.get_mut(&job_id) {
                state.expected_total = total;
                state.dirty = true;
            }
        }
        ProgressUpdate::Operation {
            job_id,
            step,
            description,
        } => {
            if let Some(state) = states.get_mut(&job_id) {
                state.step = step;
                state.operation = description;
                state.dirty = true;
            }
        }
        ProgressUpdate::Batches {
            job_id,
            completed_delta,
            total,
        } => {
            if let Some(state) = states.get_mut(&job_id) {
                state.current_batch += completed_delta;
                if let Some(total) = total {
                    state.total_batches = total;
                }
                state.dirty = true;
            }
        }
        ProgressUpdate::Finished { job_id, status } => {
            if let Some(state) = states.get_mut(&job_id) {
                state.status = status;
                state.dirty = true;
            }
        }
    }
}

async fn publish(bus: &Bus, jobs: &JobStore, job_id: JobId, state: &mut JobProgress) {
    let event = state.snapshot(job_id);
    let subject = match state.kind {
        JobKind::SnapshotRefresh => subjects::progress(job_id),
        JobKind::ManualDetection => subjects::analysis_progress(job_id),
    };
    if let Err(e) = bus.publish(&subject, &event) {
        warn!(job_id = %job_id, error = %e, "progress publish failed");
    }

    let patch = ProgressPatch {
        current_step: Some(event.step),
        total_steps: Some(event.total_steps),
        current_operation: Some(event.current_operation.clone()),
        records_per_sec: Some(event.records_per_sec),
        eta_seconds: Some(event.eta_seconds),
        current_batch: Some(event.current_batch),
        total_batches: Some(event.total_batches),
        mops_processed: Some(event.counters.mops_processed),
        mos_processed: Some(event.counters.mos_processed),
        co_lines_processed: Some(event.counters.co_lines_processed),
    };
    // Advisory: log and swallow
    if let Err(e) = jobs.set_progress(job_id, &patch).await {
        debug!(job_id = %job_id, error = %e, "progress store update failed");
    }

    state.last_published = Some(Instant::now());
    state.dirty = false;
}
