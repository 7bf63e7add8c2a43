//! Integration tests for iteration execution and the virtual user pool.

use async_trait::async_trait;
use fxdeals_loadtest::client::{ApiRequest, ApiResponse, RequestIssuer, TransportError};
use fxdeals_loadtest::errors::ErrorCategory;
use fxdeals_loadtest::load_models::LoadModel;
use fxdeals_loadtest::metrics::{MetricKey, MetricKind, MetricsAggregator, SeriesValues};
use fxdeals_loadtest::scenario::{IterationFn, Scenario, ThinkTime};
use fxdeals_loadtest::scheduler::ScenarioSummary;
use fxdeals_loadtest::vu_pool::{AcquireError, VuPool, VuState};
use fxdeals_loadtest::worker::{
    BuiltinMetrics, IterationExecutor, IterationOutcome, CHECKS, HTTP_REQ_DURATION,
    DROPPED_ITERATIONS, HTTP_REQ_FAILED, ITERATION_DURATION, VUS_MAX,
};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Replies after `latency` with `status`, or fails at the transport level.
struct ScriptedIssuer {
    latency: Duration,
    status: Option<u16>,
    body: String,
}

#[async_trait]
impl RequestIssuer for ScriptedIssuer {
    async fn issue(&self, _request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        sleep(self.latency).await;
        match self.status {
            Some(status) => Ok(ApiResponse {
                status,
                duration: self.latency,
                body: self.body.clone(),
            }),
            None => Err(TransportError {
                category: ErrorCategory::NetworkError,
                message: "connection refused".to_string(),
                duration: self.latency,
            }),
        }
    }
}

struct ImportWithThink {
    think: ThinkTime,
}

#[async_trait]
impl IterationFn for ImportWithThink {
    async fn run(&self, ctx: &mut fxdeals_loadtest::worker::IterationContext<'_>) {
        ctx.request(&ApiRequest::get_all_deals(), "status is 201", 201)
            .await;
    }

    fn think_time(&self) -> Option<ThinkTime> {
        Some(self.think)
    }
}

struct Harness {
    metrics: Arc<MetricsAggregator>,
    executor: Arc<IterationExecutor>,
    pool: Arc<VuPool>,
}

fn harness(issuer: ScriptedIssuer, think: ThinkTime) -> Harness {
    let metrics = Arc::new(MetricsAggregator::with_shards(2));
    let scenario = Scenario::new(
        "singles",
        LoadModel::ConstantVus {
            vus: 1,
            duration: Duration::from_secs(1),
        },
        Arc::new(ImportWithThink { think }),
    )
    .unwrap();
    let builtins = BuiltinMetrics::register(&metrics, "singles").unwrap();
    let executor = Arc::new(IterationExecutor::new(
        Arc::new(scenario),
        builtins,
        Arc::new(issuer),
    ));
    let pool = VuPool::new(
        "singles",
        1,
        1,
        Arc::clone(&metrics),
        Arc::new(AtomicU64::new(0)),
    );
    Harness {
        metrics,
        executor,
        pool,
    }
}

#[tokio::test(start_paused = true)]
async fn test_think_time_counts_toward_iteration_not_request_duration() {
    let h = harness(
        ScriptedIssuer {
            latency: Duration::from_millis(100),
            status: Some(201),
            body: String::new(),
        },
        ThinkTime::Fixed(Duration::from_millis(500)),
    );

    let mut lease = h.pool.acquire().unwrap();
    let iteration = h.executor.schedule(Instant::now());
    let (iteration, sample) = h.executor.run(lease.vu_mut(), iteration).await;

    assert_eq!(iteration.outcome, Some(IterationOutcome::Success));
    assert_eq!(iteration.duration(), Some(Duration::from_millis(600)));
    assert_eq!(sample.kind, MetricKind::Trend);
    assert_eq!(sample.key, MetricKey::scoped(ITERATION_DURATION, "singles"));
    assert!((sample.value - 600.0).abs() < 1e-6);

    let snapshot = h.metrics.snapshot();
    let req = snapshot
        .select(&MetricKey::scoped(HTTP_REQ_DURATION, "singles"))
        .unwrap();
    assert!((req.trend().unwrap().max().unwrap() - 100.0).abs() < 1e-6);
    let iter = snapshot
        .select(&MetricKey::scoped(ITERATION_DURATION, "singles"))
        .unwrap();
    assert!((iter.trend().unwrap().max().unwrap() - 600.0).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_status_fails_iteration_and_keeps_truncated_body() {
    let h = harness(
        ScriptedIssuer {
            latency: Duration::from_millis(10),
            status: Some(409),
            body: "x".repeat(1_000),
        },
        ThinkTime::Fixed(Duration::ZERO),
    );

    let mut lease = h.pool.acquire().unwrap();
    let iteration = h.executor.schedule(Instant::now());
    let (iteration, _) = h.executor.run(lease.vu_mut(), iteration).await;
    assert_eq!(iteration.outcome, Some(IterationOutcome::Failure));
    assert_eq!(h.executor.progress().failed(), 1);

    let snapshot = h.metrics.snapshot();
    assert_eq!(
        snapshot
            .select(&MetricKey::scoped(HTTP_REQ_FAILED, "singles"))
            .and_then(|s| s.rate()),
        Some(1.0)
    );
    assert_eq!(
        snapshot
            .select(&MetricKey::scoped(CHECKS, "singles"))
            .and_then(|s| s.rate()),
        Some(0.0)
    );

    let diag = &snapshot.diagnostics[0];
    assert_eq!(diag.status_code, Some(409));
    assert_eq!(diag.category, ErrorCategory::ClientError);
    assert_eq!(diag.check, "status is 201");
    assert!(diag.body.as_ref().unwrap().chars().count() <= 203);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_is_recorded_without_status() {
    let h = harness(
        ScriptedIssuer {
            latency: Duration::from_millis(5),
            status: None,
            body: String::new(),
        },
        ThinkTime::Fixed(Duration::ZERO),
    );

    let mut lease = h.pool.acquire().unwrap();
    let iteration = h.executor.schedule(Instant::now());
    let (iteration, _) = h.executor.run(lease.vu_mut(), iteration).await;
    assert_eq!(iteration.outcome, Some(IterationOutcome::Failure));

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.diagnostics[0].status_code, None);
    assert_eq!(snapshot.errors_by_category.get("network_error"), Some(&1));
    match snapshot.select(&MetricKey::global(HTTP_REQ_DURATION)) {
        Some(SeriesValues::Trend(t)) => assert_eq!(t.count(), 1),
        other => panic!("expected a trend, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_vu_iteration_counter_is_per_vu() {
    let h = harness(
        ScriptedIssuer {
            latency: Duration::from_millis(1),
            status: Some(201),
            body: String::new(),
        },
        ThinkTime::Fixed(Duration::ZERO),
    );

    let mut lease = h.pool.acquire().unwrap();
    for _ in 0..3 {
        let iteration = h.executor.schedule(Instant::now());
        h.executor.run(lease.vu_mut(), iteration).await;
    }
    assert_eq!(lease.vu().iterations(), 3);
    assert_eq!(h.executor.progress().completed(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_abort_drops_in_flight_iterations() {
    let h = harness(
        ScriptedIssuer {
            latency: Duration::from_secs(60),
            status: Some(201),
            body: String::new(),
        },
        ThinkTime::Fixed(Duration::ZERO),
    );
    let run_start = Instant::now();

    let executor = Arc::clone(&h.executor);
    let pool = Arc::clone(&h.pool);
    let task = tokio::spawn(async move {
        let mut lease = pool.acquire().unwrap();
        executor.mark_dispatched();
        let iteration = executor.schedule(Instant::now());
        executor.run(lease.vu_mut(), iteration).await;
    });
    sleep(Duration::from_millis(200)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let summary =
        ScenarioSummary::deadline_aborted(&h.executor, &h.pool, &h.metrics.recorder(), run_start);
    assert!(summary.deadline_aborted);
    assert_eq!(summary.state(), "deadline-aborted");
    assert!(summary.interrupted);
    assert!(!summary.skipped);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.aborted, 1);
    assert_eq!(summary.dropped, 1);
    assert_eq!(summary.peak_vus, 1);
    assert_eq!(summary.active_ms, 200);

    let snapshot = h.metrics.snapshot();
    assert_eq!(
        snapshot.counter_value(&MetricKey::scoped(DROPPED_ITERATIONS, "singles")),
        1
    );
    assert_eq!(snapshot.counter_value(&MetricKey::scoped(VUS_MAX, "singles")), 1);
    assert!(h.pool.acquire().is_err());
}

#[test]
fn test_random_think_time_stays_in_bounds() {
    let think = ThinkTime::between_ms(100, 300);
    for _ in 0..1_000 {
        let d = think.calculate_delay();
        assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(300));
    }
    assert_eq!(think.max_delay(), Duration::from_millis(300));
}

fn pool(pre: u64, max: u64) -> Arc<VuPool> {
    VuPool::new(
        "pool",
        pre,
        max,
        Arc::new(MetricsAggregator::with_shards(1)),
        Arc::new(AtomicU64::new(0)),
    )
}

#[test]
fn test_pool_grows_to_max_then_reports_exhaustion() {
    let pool = pool(1, 3);
    assert_eq!(pool.stats().spawned, 1);

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let c = pool.acquire().unwrap();
    assert_eq!(pool.acquire().unwrap_err(), AcquireError::Exhausted { max: 3 });

    let stats = pool.stats();
    assert_eq!(stats.spawned, 3);
    assert_eq!(stats.in_use, 3);
    assert_eq!(stats.peak_in_use, 3);
    drop((a, b, c));
}

#[test]
fn test_released_vu_is_reused_before_spawning() {
    let pool = pool(0, 5);
    let first_id = {
        let lease = pool.acquire().unwrap();
        assert_eq!(lease.vu().state(), VuState::Running);
        lease.vu().id()
    };

    let lease = pool.acquire().unwrap();
    assert_eq!(lease.vu().id(), first_id);
    assert_eq!(pool.stats().spawned, 1);
}

#[test]
fn test_vu_ids_are_unique_across_pools_of_a_run() {
    let metrics = Arc::new(MetricsAggregator::with_shards(1));
    let ids = Arc::new(AtomicU64::new(0));
    let singles = VuPool::new("singles", 2, 2, Arc::clone(&metrics), Arc::clone(&ids));
    let reads = VuPool::new("reads", 2, 2, metrics, ids);

    let leases = vec![
        singles.acquire().unwrap(),
        singles.acquire().unwrap(),
        reads.acquire().unwrap(),
        reads.acquire().unwrap(),
    ];
    let mut seen: Vec<u64> = leases.iter().map(|l| l.vu().id()).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3, 4]);
}

#[test]
fn test_closed_pool_refuses_leases() {
    let pool = pool(1, 1);
    pool.close();
    assert_eq!(pool.acquire().unwrap_err(), AcquireError::Closed);
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquirers_never_exceed_max() {
    let pool = pool(0, 8);
    let mut handles = Vec::new();
    for _ in 0..64 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                if let Ok(lease) = pool.acquire() {
                    tokio::task::yield_now().await;
                    drop(lease);
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = pool.stats();
    assert!(stats.peak_in_use <= 8);
    assert!(stats.spawned <= 8);
    assert_eq!(stats.in_use, 0);
}
