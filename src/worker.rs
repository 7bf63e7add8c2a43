use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, warn};

use crate::client::{ApiRequest, RequestIssuer};
use crate::errors::{ErrorCategory, RequestDiagnostic};
use crate::generator::WorkerIdentity;
use crate::metrics::{
    CounterHandle, MetricError, MetricKey, MetricKind, MetricSample, MetricsAggregator, RateHandle,
    Recorder, TrendHandle,
};
use crate::scenario::Scenario;
use crate::utils::truncate_body;
use crate::vu_pool::VirtualUser;

/// Characters of a failing response body kept in logs and diagnostics.
pub const DIAGNOSTIC_BODY_CHARS: usize = 200;

/// Built-in metric names.
pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const CHECKS: &str = "checks";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
pub const VUS_MAX: &str = "vus_max";

/// Handles to the metrics every scenario records, scoped to that scenario.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinMetrics {
    pub http_reqs: CounterHandle,
    pub http_req_duration: TrendHandle,
    pub http_req_failed: RateHandle,
    pub checks: RateHandle,
    pub iterations: CounterHandle,
    pub iteration_duration: TrendHandle,
    pub dropped_iterations: CounterHandle,
    /// Peak pool occupancy, added once when the scenario finishes. Merged
    /// across scenarios it is the sum of their peaks, an upper bound on the
    /// VUs that were ever busy at once.
    pub vus_max: CounterHandle,
}

impl BuiltinMetrics {
    pub fn register(metrics: &MetricsAggregator, scenario: &str) -> Result<Self, MetricError> {
        let key = |name: &str| MetricKey::scoped(name, scenario);
        Ok(Self {
            http_reqs: metrics.counter(key(HTTP_REQS))?,
            http_req_duration: metrics.trend(key(HTTP_REQ_DURATION))?,
            http_req_failed: metrics.rate(key(HTTP_REQ_FAILED))?,
            checks: metrics.rate(key(CHECKS))?,
            iterations: metrics.counter(key(ITERATIONS))?,
            iteration_duration: metrics.trend(key(ITERATION_DURATION))?,
            dropped_iterations: metrics.counter(key(DROPPED_ITERATIONS))?,
            vus_max: metrics.counter(key(VUS_MAX))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationOutcome {
    Success,
    Failure,
    Dropped,
}

/// One scheduled execution of a scenario's iteration function.
#[derive(Debug, Clone)]
pub struct Iteration {
    pub scenario: Arc<str>,
    pub vu_id: Option<u64>,
    pub scheduled_at: Instant,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub outcome: Option<IterationOutcome>,
}

impl Iteration {
    pub fn scheduled(scenario: Arc<str>, scheduled_at: Instant) -> Self {
        Self {
            scenario,
            vu_id: None,
            scheduled_at,
            started_at: None,
            completed_at: None,
            outcome: None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        Some(self.completed_at?.duration_since(self.started_at?))
    }

    /// Delay between the scheduled and the actual start.
    pub fn start_lag(&self) -> Option<Duration> {
        Some(self.started_at?.duration_since(self.scheduled_at))
    }
}

/// Lock-free lifecycle counters of one scenario run.
#[derive(Debug, Default)]
pub struct ScenarioProgress {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicU64,
    max_start_lag_us: AtomicU64,
    first_dispatch: OnceLock<Instant>,
}

impl ScenarioProgress {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Longest delay between an iteration falling due and starting.
    pub fn max_start_lag(&self) -> Duration {
        Duration::from_micros(self.max_start_lag_us.load(Ordering::Relaxed))
    }

    pub fn first_dispatch(&self) -> Option<Instant> {
        self.first_dispatch.get().copied()
    }
}

/// Per-iteration execution context handed to the scenario's iteration function.
pub struct IterationContext<'a> {
    scenario: &'a str,
    vu_id: u64,
    iteration: u64,
    recorder: &'a Recorder,
    builtins: &'a BuiltinMetrics,
    issuer: &'a dyn RequestIssuer,
    failed: bool,
}

/// What a checked request produced.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub status: Option<u16>,
    pub duration: Duration,
    pub passed: bool,
}

impl<'a> IterationContext<'a> {
    pub fn scenario(&self) -> &str {
        self.scenario
    }

    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// Per-VU iteration number, starting at 0.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity {
            vu_id: self.vu_id,
            iteration: self.iteration,
        }
    }

    pub fn recorder(&self) -> &Recorder {
        self.recorder
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Issues `request` and checks that it came back with `expected_status`.
    ///
    /// Records `http_reqs`, `http_req_duration`, `http_req_failed` and `checks`.
    /// A failed check is logged with a truncated body excerpt and marks the
    /// iteration as failed; it never aborts the run.
    pub async fn request(
        &mut self,
        request: &ApiRequest,
        check: &str,
        expected_status: u16,
    ) -> RequestOutcome {
        let result = self.issuer.issue(request).await;

        let (status, duration, body, transport_error) = match result {
            Ok(response) => (
                Some(response.status),
                response.duration,
                Some(response.body),
                None,
            ),
            Err(e) => (None, e.duration, None, Some(e)),
        };
        let passed = status == Some(expected_status);

        self.recorder.add(self.builtins.http_reqs, 1);
        self.recorder.observe(
            self.builtins.http_req_duration,
            duration.as_secs_f64() * 1000.0,
        );
        self.recorder.rate(self.builtins.http_req_failed, !passed);
        self.recorder.rate(self.builtins.checks, passed);

        if !passed {
            self.failed = true;
            let (category, message) = match (&transport_error, status) {
                (Some(e), _) => (e.category, e.message.clone()),
                (None, Some(code)) => (
                    ErrorCategory::from_unexpected_status(code),
                    format!("expected status {}, got {}", expected_status, code),
                ),
                (None, None) => (ErrorCategory::OtherError, "no response".to_string()),
            };
            let body = body.map(|b| truncate_body(&b, DIAGNOSTIC_BODY_CHARS));

            warn!(
                scenario = self.scenario,
                vu_id = self.vu_id,
                iteration = self.iteration,
                check,
                status_code = ?status,
                error_category = category.label(),
                body = body.as_deref().unwrap_or(""),
                "{}",
                message
            );

            self.recorder.diagnostic(RequestDiagnostic {
                scenario: self.scenario.to_string(),
                check: check.to_string(),
                category,
                status_code: status,
                body,
                message,
            });
        }

        RequestOutcome {
            status,
            duration,
            passed,
        }
    }

    /// Records a custom check into the `checks` rate.
    pub fn check(&mut self, name: &str, passed: bool) {
        self.recorder.rate(self.builtins.checks, passed);
        if !passed {
            self.failed = true;
            debug!(scenario = self.scenario, vu_id = self.vu_id, check = name, "Check failed");
        }
    }

    /// Marks the iteration failed without a request, e.g. when a payload
    /// could not be built.
    pub fn fail(&mut self, check: &str, message: impl Into<String>) {
        let message = message.into();
        self.check(check, false);
        warn!(scenario = self.scenario, vu_id = self.vu_id, check, "{}", message);
        self.recorder.diagnostic(RequestDiagnostic {
            scenario: self.scenario.to_string(),
            check: check.to_string(),
            category: ErrorCategory::OtherError,
            status_code: None,
            body: None,
            message,
        });
    }
}

/// Runs iterations of one scenario and records their lifecycle.
pub struct IterationExecutor {
    scenario: Arc<Scenario>,
    name: Arc<str>,
    builtins: BuiltinMetrics,
    issuer: Arc<dyn RequestIssuer>,
    progress: Arc<ScenarioProgress>,
}

impl IterationExecutor {
    pub fn new(
        scenario: Arc<Scenario>,
        builtins: BuiltinMetrics,
        issuer: Arc<dyn RequestIssuer>,
    ) -> Self {
        let name: Arc<str> = Arc::from(scenario.name.as_str());
        Self {
            scenario,
            name,
            builtins,
            issuer,
            progress: Arc::new(ScenarioProgress::default()),
        }
    }

    pub fn scenario(&self) -> &Arc<Scenario> {
        &self.scenario
    }

    pub fn scenario_name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn builtins(&self) -> &BuiltinMetrics {
        &self.builtins
    }

    pub fn progress(&self) -> &Arc<ScenarioProgress> {
        &self.progress
    }

    /// A fresh iteration scheduled for `at`.
    pub fn schedule(&self, at: Instant) -> Iteration {
        Iteration::scheduled(Arc::clone(&self.name), at)
    }

    /// Counts an iteration as started. Called by the scheduler before it
    /// hands the iteration to a task.
    pub fn mark_dispatched(&self) {
        self.progress.dispatched.fetch_add(1, Ordering::Relaxed);
        let _ = self.progress.first_dispatch.set(Instant::now());
    }

    /// Records an iteration that never ran or was aborted at the grace deadline.
    pub fn record_dropped(&self, recorder: &Recorder, mut iteration: Iteration) -> Iteration {
        iteration.outcome = Some(IterationOutcome::Dropped);
        recorder.add(self.builtins.dropped_iterations, 1);
        self.progress.dropped.fetch_add(1, Ordering::Relaxed);
        iteration
    }

    /// Records every iteration still in flight as dropped. Only called once
    /// the scenario's tasks have been aborted and joined.
    pub fn record_aborted(&self, recorder: &Recorder) -> u64 {
        let count = self.progress.in_flight.swap(0, Ordering::Relaxed);
        if count > 0 {
            recorder.add(self.builtins.dropped_iterations, count);
            self.progress.dropped.fetch_add(count, Ordering::Relaxed);
        }
        count
    }

    /// Runs one iteration on `vu` and returns its `iteration_duration` sample.
    ///
    /// Think time is slept inside the VU after the iteration function returns
    /// and counts toward the iteration's duration, never toward request latency.
    pub async fn run(&self, vu: &mut VirtualUser, mut iteration: Iteration) -> (Iteration, MetricSample) {
        let iteration_number = vu.next_iteration();
        iteration.vu_id = Some(vu.id());
        iteration.started_at = Some(Instant::now());
        if let Some(lag) = iteration.start_lag() {
            let lag_us = u64::try_from(lag.as_micros()).unwrap_or(u64::MAX);
            self.progress.max_start_lag_us.fetch_max(lag_us, Ordering::Relaxed);
        }
        self.progress.in_flight.fetch_add(1, Ordering::Relaxed);

        let mut ctx = IterationContext {
            scenario: &*self.name,
            vu_id: vu.id(),
            iteration: iteration_number,
            recorder: vu.recorder(),
            builtins: &self.builtins,
            issuer: self.issuer.as_ref(),
            failed: false,
        };
        self.scenario.exec.run(&mut ctx).await;
        let failed = ctx.has_failed();

        if let Some(think) = self.scenario.exec.think_time() {
            time::sleep(think.calculate_delay()).await;
        }

        let completed_at = Instant::now();
        iteration.completed_at = Some(completed_at);
        iteration.outcome = Some(if failed {
            IterationOutcome::Failure
        } else {
            IterationOutcome::Success
        });

        let duration_ms = iteration
            .duration()
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or_default();
        let recorder = vu.recorder();
        recorder.add(self.builtins.iterations, 1);
        recorder.observe(self.builtins.iteration_duration, duration_ms);

        // Saturating: a run cut off at its deadline may already have counted
        // this iteration as aborted.
        let _ = self
            .progress
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.progress.completed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.progress.failed.fetch_add(1, Ordering::Relaxed);
        }

        let sample = MetricSample {
            key: MetricKey::scoped(ITERATION_DURATION, &*self.name),
            kind: MetricKind::Trend,
            value: duration_ms,
            timestamp: completed_at,
        };
        (iteration, sample)
    }
}
