//! Integration tests for the run-wide metrics aggregator.

use fxdeals_loadtest::errors::{ErrorCategory, RequestDiagnostic};
use fxdeals_loadtest::metrics::{
    MetricError, MetricKey, MetricKind, MetricSample, MetricsAggregator, SeriesValues,
    SummaryValues,
};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_counter_increments_are_not_lost() {
    let metrics = Arc::new(MetricsAggregator::new());
    let key = MetricKey::scoped("iterations", "load");
    let counter = metrics.counter(key.clone()).unwrap();

    let mut handles = Vec::new();
    for _ in 0..100 {
        let recorder = metrics.recorder();
        handles.push(tokio::spawn(async move {
            for _ in 0..1000 {
                recorder.add(counter, 1);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(metrics.snapshot().counter_value(&key), 100_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_trend_samples_are_all_counted() {
    let metrics = Arc::new(MetricsAggregator::with_shards(4));
    let key = MetricKey::scoped("http_req_duration", "load");
    let trend = metrics.trend(key.clone()).unwrap();

    let mut handles = Vec::new();
    for worker in 0..20u64 {
        let recorder = metrics.recorder();
        handles.push(tokio::spawn(async move {
            for i in 0..500u64 {
                recorder.observe(trend, (worker * 500 + i) as f64);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = metrics.snapshot();
    let dist = snapshot.get(&key).and_then(SeriesValues::trend).unwrap();
    assert_eq!(dist.count(), 10_000);
    assert_eq!(dist.min(), Some(0.0));
    assert_eq!(dist.max(), Some(9_999.0));
}

#[test]
fn test_registering_same_name_with_other_kind_fails() {
    let metrics = MetricsAggregator::with_shards(1);
    metrics.counter(MetricKey::global("deals")).unwrap();

    let err = metrics.trend(MetricKey::global("deals")).unwrap_err();
    assert_eq!(
        err,
        MetricError::KindMismatch {
            key: "deals".to_string(),
            existing: MetricKind::Counter,
            requested: MetricKind::Trend,
        }
    );

    // Re-registering with the same kind returns the existing handle.
    let a = metrics.counter(MetricKey::global("deals")).unwrap();
    let b = metrics.counter(MetricKey::global("deals")).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_free_standing_sample_with_wrong_kind_is_rejected() {
    let metrics = Arc::new(MetricsAggregator::with_shards(1));
    metrics.rate(MetricKey::global("checks")).unwrap();

    let sample = MetricSample::new(MetricKey::global("checks"), MetricKind::Counter, 1.0);
    assert!(metrics.record(&sample).is_err());
    assert!(metrics.recorder().record(&sample).is_err());
}

#[test]
fn test_scenarios_do_not_contaminate_each_other() {
    let metrics = Arc::new(MetricsAggregator::with_shards(2));
    let singles = metrics
        .trend(MetricKey::scoped("http_req_duration", "singles"))
        .unwrap();
    let reads = metrics
        .trend(MetricKey::scoped("http_req_duration", "reads"))
        .unwrap();
    let recorder = metrics.recorder();

    for _ in 0..10 {
        recorder.observe(singles, 100.0);
    }
    for _ in 0..30 {
        recorder.observe(reads, 10.0);
    }

    let snapshot = metrics.snapshot();
    let singles_series = snapshot
        .select(&MetricKey::scoped("http_req_duration", "singles"))
        .unwrap();
    assert_eq!(singles_series.count(), 10);
    assert_eq!(singles_series.trend().unwrap().max(), Some(100.0));

    let merged = snapshot
        .select(&MetricKey::global("http_req_duration"))
        .unwrap();
    assert_eq!(merged.count(), 40);
    assert_eq!(merged.trend().unwrap().min(), Some(10.0));
}

#[test]
fn test_rate_tracks_hits_and_total() {
    let metrics = Arc::new(MetricsAggregator::with_shards(2));
    let failed = metrics
        .rate(MetricKey::scoped("http_req_failed", "load"))
        .unwrap();
    let recorder = metrics.recorder();

    for i in 0..200 {
        recorder.rate(failed, i % 4 == 0);
    }

    let snapshot = metrics.snapshot();
    let series = snapshot.merged("http_req_failed").unwrap();
    assert_eq!(series.rate(), Some(0.25));
    match series.summary_values() {
        SummaryValues::Rate { passes, fails, .. } => {
            assert_eq!(passes, 50);
            assert_eq!(fails, 150);
        }
        other => panic!("expected rate summary, got {:?}", other),
    }
}

#[test]
fn test_registered_but_unrecorded_series_is_empty() {
    let metrics = MetricsAggregator::with_shards(2);
    metrics
        .trend(MetricKey::scoped("stress_get_all_latency", "stress"))
        .unwrap();

    let snapshot = metrics.snapshot();
    let series = snapshot.merged("stress_get_all_latency").unwrap();
    assert_eq!(series.count(), 0);
    assert!(series.trend().unwrap().stats().is_none());
    assert!(series.rate().is_none());
}

#[test]
fn test_snapshot_is_independent_of_later_writes() {
    let metrics = Arc::new(MetricsAggregator::with_shards(2));
    let key = MetricKey::global("http_reqs");
    let counter = metrics.counter(key.clone()).unwrap();
    let recorder = metrics.recorder();

    recorder.add(counter, 5);
    let before = metrics.snapshot();
    recorder.add(counter, 5);

    assert_eq!(before.counter_value(&key), 5);
    assert_eq!(metrics.snapshot().counter_value(&key), 10);
}

#[test]
fn test_diagnostics_are_counted_by_category() {
    let metrics = Arc::new(MetricsAggregator::with_shards(1));
    let recorder = metrics.recorder();

    for status in [500u16, 503, 404] {
        recorder.diagnostic(RequestDiagnostic {
            scenario: "singles".to_string(),
            check: "single import status is 201".to_string(),
            category: ErrorCategory::from_unexpected_status(status),
            status_code: Some(status),
            body: Some("oops".to_string()),
            message: format!("status {}", status),
        });
    }

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.diagnostics.len(), 3);
    assert_eq!(snapshot.errors_by_category.values().sum::<u64>(), 3);
    assert_eq!(
        snapshot
            .errors_by_category
            .get(ErrorCategory::ServerError.label()),
        Some(&2)
    );
}
