//! End-to-end refresh flows over an in-memory store, the in-process bus and
//! a scripted fabric client.

use async_trait::async_trait;
use millrace_bus::Bus;
use millrace_db::MillraceDb;
use millrace_engine::{
    spawn_cancel_listener, spawn_progress_publisher, BatchWorkerPool, DetectionSummary,
    DetectorPipeline, EngineContext, Orchestrator,
};
use millrace_protocol::{
    subjects, EnvId, JobId, JobKind, JobStatus, PhaseKind, PhaseStatus, RefreshOptions,
    RefreshRequest,
};
use millrace_store::PhasePatch;
use millrace_upstream::{JobHandle, RateLimiter, ResultPage, SqlJobClient, UpstreamError};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ----------------------------------------------------------------------
// Scripted fabric
// ----------------------------------------------------------------------

/// In-memory Data Fabric: serves scripted rows per source table, executes
/// the id-range predicate of batch queries, and can be told to fail
/// queries matching a marker.
#[derive(Default)]
struct ScriptedFabric {
    tables: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
    /// Queries containing this marker report upstream job failure.
    fail_marker: Mutex<Option<String>>,
    submitted: Mutex<Vec<String>>,
    next_handle: AtomicU64,
    jobs: Mutex<HashMap<String, String>>,
}

impl ScriptedFabric {
    fn with_table(self, table: &str, rows: Vec<Map<String, Value>>) -> Self {
        self.tables.lock().unwrap().insert(table.to_string(), rows);
        self
    }

    fn fail_queries_containing(&self, marker: &str) {
        *self.fail_marker.lock().unwrap() = Some(marker.to_string());
    }

    fn submitted_queries(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    fn identity_column(table: &str) -> &'static str {
        match table {
            "MMOPLP" => "PLPN",
            "MWOHED" => "MOID",
            "OOLINE" => "OLID",
            _ => "ID",
        }
    }

    /// Execute the scripted subset of SQL this engine emits.
    fn execute(&self, sql: &str) -> Vec<Map<String, Value>> {
        let tables = self.tables.lock().unwrap();
        let Some((table, rows)) = tables
            .iter()
            .find(|(name, _)| sql.contains(&format!("FROM {name}")))
        else {
            return Vec::new();
        };

        let id_col = Self::identity_column(table);
        if sql.contains("MIN(") {
            let ids: Vec<i64> = rows
                .iter()
                .filter_map(|r| r.get(id_col).and_then(Value::as_i64))
                .collect();
            if ids.is_empty() {
                let mut row = Map::new();
                row.insert("min_id".into(), Value::Null);
                row.insert("max_id".into(), Value::Null);
                row.insert("row_count".into(), json!(0));
                return vec![row];
            }
            let mut row = Map::new();
            row.insert("min_id".into(), json!(ids.iter().min().unwrap()));
            row.insert("max_id".into(), json!(ids.iter().max().unwrap()));
            row.insert("row_count".into(), json!(ids.len()));
            return vec![row];
        }

        let low = parse_bound(sql, &format!("{id_col} >= "));
        let high = parse_bound(sql, &format!("{id_col} < "));
        rows.iter()
            .filter(|r| {
                let id = r.get(id_col).and_then(Value::as_i64).unwrap_or(0);
                low.map(|b| id >= b).unwrap_or(true) && high.map(|b| id < b).unwrap_or(true)
            })
            .cloned()
            .collect()
    }
}

fn parse_bound(sql: &str, prefix: &str) -> Option<i64> {
    sql.split(prefix).nth(1)?.split_whitespace().next()?.parse().ok()
}

#[async_trait]
impl SqlJobClient for ScriptedFabric {
    async fn submit(&self, _env: &EnvId, sql: &str) -> Result<JobHandle, UpstreamError> {
        self.submitted.lock().unwrap().push(sql.to_string());
        let id = format!("fab-{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().unwrap().insert(id.clone(), sql.to_string());
        Ok(JobHandle { id })
    }

    async fn status(
        &self,
        _env: &EnvId,
        handle: &JobHandle,
    ) -> Result<millrace_upstream::UpstreamJobStatus, UpstreamError> {
        let sql = self.jobs.lock().unwrap().get(&handle.id).cloned().unwrap_or_default();
        if let Some(marker) = self.fail_marker.lock().unwrap().as_deref() {
            if sql.contains(marker) {
                return Ok(millrace_upstream::UpstreamJobStatus::Failed {
                    error: "scripted failure".to_string(),
                });
            }
        }
        Ok(millrace_upstream::UpstreamJobStatus::Completed)
    }

    async fn fetch_page(
        &self,
        _env: &EnvId,
        handle: &JobHandle,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ResultPage, UpstreamError> {
        let sql = self.jobs.lock().unwrap().get(&handle.id).cloned().unwrap_or_default();
        let all = self.execute(&sql);
        let offset: usize = cursor.map(|c| c.parse().unwrap_or(0)).unwrap_or(0);
        let end = (offset + limit as usize).min(all.len());
        let rows = all[offset..end].to_vec();
        let next_cursor = (end < all.len()).then(|| end.to_string());
        Ok(ResultPage { rows, next_cursor })
    }

    async fn cancel(&self, _env: &EnvId, _handle: &JobHandle) -> Result<(), UpstreamError> {
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Stub detector pipeline
// ----------------------------------------------------------------------

#[derive(Default)]
struct StubDetectors {
    invocations: AtomicU32,
}

#[async_trait]
impl DetectorPipeline for StubDetectors {
    async fn run(
        &self,
        _env: &EnvId,
        _job_id: JobId,
        _only: &[String],
    ) -> anyhow::Result<DetectionSummary> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(DetectionSummary {
            detectors_run: 1,
            issues_found: 0,
            ..Default::default()
        })
    }
}

// ----------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------

fn mop_row(plpn: i64) -> Map<String, Value> {
    serde_json::from_value(json!({
        "PLPN": plpn, "CONO": "100", "FACI": "F01", "WHLO": "W01",
        "PRNO": format!("ITEM-{plpn}"), "PSTS": "20", "PPQT": "10",
        "STDT": "20260810", "LMDT": "20260801"
    }))
    .unwrap()
}

fn mo_row(moid: i64) -> Map<String, Value> {
    serde_json::from_value(json!({
        "MOID": moid, "CONO": "100", "FACI": "F01", "WHLO": "W01",
        "MWNO": format!("MO-{moid}"), "PRNO": "ITEM-1", "WHST": "40",
        "ORQT": "5", "PAQT": "0", "STDT": "20260812", "LMDT": "20260801",
        "RORN": "CO-1", "RORL": "1", "RORX": "0"
    }))
    .unwrap()
}

fn co_row(olid: i64) -> Map<String, Value> {
    serde_json::from_value(json!({
        "OLID": olid, "CONO": "100", "FACI": "F01", "WHLO": "W01",
        "ORNO": "CO-1", "PONR": olid.to_string(), "POSX": "0",
        "ITNO": "ITEM-1", "ORST": "33", "ORQT": "15", "RNQT": "15",
        "CUNO": "C100", "CODT": "20260815", "LMDT": "20260801"
    }))
    .unwrap()
}

struct Harness {
    ctx: Arc<EngineContext>,
    orchestrator: Orchestrator,
    fabric: Arc<ScriptedFabric>,
    detectors: Arc<StubDetectors>,
    env: EnvId,
    _workers: BatchWorkerPool,
}

async fn harness(fabric: ScriptedFabric) -> Harness {
    let db = MillraceDb::open_memory().await.unwrap();
    db.ensure_schema().await.unwrap();
    let bus = Bus::new();
    let fabric = Arc::new(fabric);
    let limiter = Arc::new(RateLimiter::new());
    let env = EnvId::new("TRN").unwrap();

    let jobs = millrace_store::JobStore::new(&db);
    let (progress, _progress_handle) = spawn_progress_publisher(bus.clone(), jobs);
    let ctx = Arc::new(EngineContext::new(
        db,
        bus.clone(),
        fabric.clone(),
        limiter,
        progress,
    ));
    spawn_cancel_listener(&bus, ctx.cancels.clone());
    let workers = BatchWorkerPool::spawn(ctx.clone(), &[env.clone()], 2);

    let detectors = Arc::new(StubDetectors::default());
    let orchestrator = Orchestrator::new(ctx.clone(), detectors.clone());
    Harness {
        ctx,
        orchestrator,
        fabric,
        detectors,
        env,
        _workers: workers,
    }
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn happy_path_small_refresh() {
    let fabric = ScriptedFabric::default()
        .with_table("MMOPLP", vec![mop_row(1), mop_row(2), mop_row(3)])
        .with_table("MWOHED", vec![mo_row(10), mo_row(11)])
        .with_table("OOLINE", vec![co_row(1)]);
    let h = harness(fabric).await;

    let job_id = h.ctx.jobs.create(&h.env, JobKind::SnapshotRefresh).await.unwrap();
    h.orchestrator
        .run_refresh(RefreshRequest {
            job_id,
            env: h.env.clone(),
            options: RefreshOptions::default(),
        })
        .await
        .unwrap();

    let job = h.ctx.jobs.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.mops_processed, 3);
    assert_eq!(job.mos_processed, 2);
    assert_eq!(job.co_lines_processed, 1);
    assert!(job.completed_at.is_some());

    // One batch per phase at the default batch size
    let phases = h.ctx.jobs.phases(job_id).await.unwrap();
    assert_eq!(phases.len(), 3);
    for phase in &phases {
        assert_eq!(phase.status, PhaseStatus::Completed, "{:?}", phase.kind);
    }
    let counts: HashMap<PhaseKind, i64> =
        phases.iter().map(|p| (p.kind, p.record_count)).collect();
    assert_eq!(counts[&PhaseKind::Mops], 3);
    assert_eq!(counts[&PhaseKind::Mos], 2);
    assert_eq!(counts[&PhaseKind::Cos], 1);

    // Snapshot rows landed
    assert_eq!(h.ctx.snapshots.row_count(&h.env, PhaseKind::Mops).await.unwrap(), 3);
    assert_eq!(h.ctx.snapshots.row_count(&h.env, PhaseKind::Cos).await.unwrap(), 1);

    // Phase record counts account exactly for the rows this run touched
    let started_at = job.started_at.as_deref().unwrap();
    for (phase, expected) in [(PhaseKind::Mops, 3u64), (PhaseKind::Mos, 2), (PhaseKind::Cos, 1)] {
        assert_eq!(
            h.ctx
                .snapshots
                .rows_synced_since(&h.env, phase, started_at)
                .await
                .unwrap(),
            expected
        );
    }

    assert_eq!(h.detectors.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_refresh_on_unchanged_upstream_is_stable() {
    let fabric = ScriptedFabric::default()
        .with_table("MMOPLP", vec![mop_row(1), mop_row(2)])
        .with_table("MWOHED", vec![mo_row(10)])
        .with_table("OOLINE", vec![co_row(1)]);
    let h = harness(fabric).await;

    for _ in 0..2 {
        let job_id = h.ctx.jobs.create(&h.env, JobKind::SnapshotRefresh).await.unwrap();
        h.orchestrator
            .run_refresh(RefreshRequest {
                job_id,
                env: h.env.clone(),
                options: RefreshOptions::default(),
            })
            .await
            .unwrap();
        assert_eq!(h.ctx.jobs.get(job_id).await.unwrap().status, JobStatus::Completed);
    }

    // Same live row set, nothing flagged as deleted
    assert_eq!(h.ctx.snapshots.row_count(&h.env, PhaseKind::Mops).await.unwrap(), 2);
    assert_eq!(h.ctx.snapshots.row_count(&h.env, PhaseKind::Mos).await.unwrap(), 1);
    assert_eq!(h.ctx.snapshots.row_count(&h.env, PhaseKind::Cos).await.unwrap(), 1);
    let lines = h.ctx.snapshots.customer_order_lines(&h.env).await.unwrap();
    assert!(lines.iter().all(|l| !l.deleted_remotely));
}

#[tokio::test]
async fn empty_upstream_completes_with_zero_batches() {
    let fabric = ScriptedFabric::default()
        .with_table("MMOPLP", vec![])
        .with_table("MWOHED", vec![])
        .with_table("OOLINE", vec![]);
    let h = harness(fabric).await;

    let job_id = h.ctx.jobs.create(&h.env, JobKind::SnapshotRefresh).await.unwrap();
    h.orchestrator
        .run_refresh(RefreshRequest {
            job_id,
            env: h.env.clone(),
            options: RefreshOptions::default(),
        })
        .await
        .unwrap();

    let job = h.ctx.jobs.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    for phase in h.ctx.jobs.phases(job_id).await.unwrap() {
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert_eq!(phase.record_count, 0);
    }
    assert_eq!(h.detectors.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_phase_fails_the_job() {
    let fabric = ScriptedFabric::default()
        .with_table("MMOPLP", vec![mop_row(1)])
        .with_table("MWOHED", vec![mo_row(10)])
        .with_table("OOLINE", vec![co_row(1)]);
    let h = harness(fabric).await;
    // Stats queries carry no WHERE clause, so only the batch select fails
    h.fabric.fail_queries_containing("FROM MWOHED WHERE");

    let mut errors = h.ctx.bus.subscribe("snapshot.error.*").unwrap();

    let job_id = h.ctx.jobs.create(&h.env, JobKind::SnapshotRefresh).await.unwrap();
    let result = h
        .orchestrator
        .run_refresh(RefreshRequest {
            job_id,
            env: h.env.clone(),
            options: RefreshOptions::default(),
        })
        .await;
    assert!(result.is_err());

    let job = h.ctx.jobs.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("mos"));

    let phases: HashMap<PhaseKind, PhaseStatus> = h
        .ctx
        .jobs
        .phases(job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.kind, p.status))
        .collect();
    assert_eq!(phases[&PhaseKind::Mos], PhaseStatus::Failed);
    assert_eq!(phases[&PhaseKind::Mops], PhaseStatus::Completed);

    // Detectors never start on a failed load
    assert_eq!(h.detectors.invocations.load(Ordering::SeqCst), 0);
    assert!(errors.try_recv().is_some());
}

#[tokio::test]
async fn cancel_before_planning_skips_everything() {
    let fabric = ScriptedFabric::default()
        .with_table("MMOPLP", vec![mop_row(1)])
        .with_table("MWOHED", vec![mo_row(10)])
        .with_table("OOLINE", vec![co_row(1)]);
    let h = harness(fabric).await;

    let job_id = h.ctx.jobs.create(&h.env, JobKind::SnapshotRefresh).await.unwrap();
    h.ctx.bus.publish(&subjects::cancel(job_id), &serde_json::json!({})).unwrap();
    // Let the cancel listener flip the flag
    for _ in 0..20 {
        if h.ctx.cancels.flag(job_id).is_cancelled() {
            break;
        }
        tokio::task::yield_now().await;
    }

    h.orchestrator
        .run_refresh(RefreshRequest {
            job_id,
            env: h.env.clone(),
            options: RefreshOptions::default(),
        })
        .await
        .unwrap();

    let job = h.ctx.jobs.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    for phase in h.ctx.jobs.phases(job_id).await.unwrap() {
        assert_eq!(phase.status, PhaseStatus::Cancelled);
    }
    // Neither reconciler nor detectors ran
    assert_eq!(h.detectors.invocations.load(Ordering::SeqCst), 0);
    assert_eq!(h.ctx.snapshots.row_count(&h.env, PhaseKind::Mops).await.unwrap(), 0);
}

#[tokio::test]
async fn recover_resumes_only_unfinished_phases() {
    let fabric = ScriptedFabric::default()
        .with_table("MMOPLP", vec![mop_row(1), mop_row(2)])
        .with_table("MWOHED", vec![mo_row(10)])
        .with_table("OOLINE", vec![co_row(1)]);
    let h = harness(fabric).await;

    // Simulate a crashed process: job left running, MOPs already done
    let job_id = h.ctx.jobs.create(&h.env, JobKind::SnapshotRefresh).await.unwrap();
    h.ctx.jobs.transition(job_id, JobStatus::Running, None).await.unwrap();
    h.ctx
        .jobs
        .upsert_phase(
            job_id,
            PhaseKind::Mops,
            &PhasePatch {
                status: Some(PhaseStatus::Completed),
                record_count: Some(120),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.orchestrator.recover(&h.env).await.unwrap();

    let job = h.ctx.jobs.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // The completed resumable phase kept its counts and was not re-planned
    let phases: HashMap<PhaseKind, i64> = h
        .ctx
        .jobs
        .phases(job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.kind, p.record_count))
        .collect();
    assert_eq!(phases[&PhaseKind::Mops], 120);
    assert_eq!(phases[&PhaseKind::Mos], 1);

    assert!(!h
        .fabric
        .submitted_queries()
        .iter()
        .any(|sql| sql.contains("MMOPLP")));
}

#[tokio::test]
async fn enrichment_joins_reference_lookups_into_co_lines() {
    let mut customer = Map::new();
    customer.insert("CUNM".into(), json!("Acme Industrial"));
    let fabric = ScriptedFabric::default()
        .with_table("MMOPLP", vec![])
        .with_table("MWOHED", vec![])
        .with_table("OOLINE", vec![co_row(1)])
        .with_table("OCUSMA", vec![customer]);
    let h = harness(fabric).await;

    let job_id = h.ctx.jobs.create(&h.env, JobKind::SnapshotRefresh).await.unwrap();
    h.orchestrator
        .run_refresh(RefreshRequest {
            job_id,
            env: h.env.clone(),
            options: RefreshOptions::default(),
        })
        .await
        .unwrap();

    let lines = h.ctx.snapshots.customer_order_lines(&h.env).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].customer_name.as_deref(), Some("Acme Industrial"));
    // An unknown item leaves its description empty without failing the job
    assert_eq!(lines[0].item_description, None);

    // The lookup landed in the reference cache
    assert_eq!(
        h.ctx
            .reference
            .get(&h.env, "100", "customer", "C100")
            .await
            .unwrap()
            .as_deref(),
        Some("Acme Industrial")
    );
}

#[tokio::test]
async fn reconciler_flags_rows_missing_from_full_refresh() {
    let fabric = ScriptedFabric::default()
        .with_table("MMOPLP", vec![])
        .with_table("MWOHED", vec![])
        .with_table("OOLINE", vec![co_row(1)]);
    let h = harness(fabric).await;

    // A line from an earlier refresh that the upstream no longer returns
    let stale = millrace_store::CustomerOrderLineRow {
        env: "TRN".into(),
        source_id: 99,
        order_number: "CO-OLD".into(),
        line_number: "1".into(),
        ..Default::default()
    };
    h.ctx
        .snapshots
        .upsert_customer_order_lines(&[stale], "2026-01-01T00:00:00+00:00")
        .await
        .unwrap();

    let job_id = h.ctx.jobs.create(&h.env, JobKind::SnapshotRefresh).await.unwrap();
    h.orchestrator
        .run_refresh(RefreshRequest {
            job_id,
            env: h.env.clone(),
            options: RefreshOptions { full_refresh: true },
        })
        .await
        .unwrap();

    // CO-OLD flagged, the refreshed line alive
    assert_eq!(h.ctx.snapshots.row_count(&h.env, PhaseKind::Cos).await.unwrap(), 1);
    let lines = h.ctx.snapshots.customer_order_lines(&h.env).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].order_number, "CO-1");
}
