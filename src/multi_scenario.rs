//! Running several scenarios as one test.
//!
//! A [`TestPlan`] groups scenarios with the thresholds that judge them. The
//! [`ScenarioOrchestrator`] starts each scenario at its own offset from the
//! run start, lets them overlap freely, and once every scenario has drained
//! takes one snapshot of the shared [`MetricsAggregator`] for the verdict.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Duration, Instant};
use tracing::{error, info, warn};

use crate::client::RequestIssuer;
use crate::config_validation::{ValidationContext, ValidationError};
use crate::metrics::{MetricError, MetricKey, MetricsAggregator, MetricsSnapshot};
use crate::scenario::Scenario;
use crate::scheduler::{ScenarioRunner, ScenarioSummary, DEFAULT_TICK_INTERVAL};
use crate::thresholds::{Threshold, ThresholdEvaluator, ThresholdParseError, ThresholdReport};
use crate::vu_pool::VuPool;
use crate::worker::{
    BuiltinMetrics, IterationExecutor, DROPPED_ITERATIONS, HTTP_REQS, HTTP_REQ_DURATION, ITERATIONS,
};

/// Extra time past the last grace deadline before the run is cut short.
const HARD_DEADLINE_SLACK: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("invalid threshold: {0}")]
    Threshold(#[from] ThresholdParseError),

    #[error("metric registration failed: {0}")]
    Metric(#[from] MetricError),

    #[error("scenario task failed: {0}")]
    SchedulerFault(String),
}

impl RunError {
    /// Whether the run was refused before it started.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            RunError::InvalidConfig(_) | RunError::Threshold(_) | RunError::Metric(_)
        )
    }
}

/// Scenarios and the thresholds that judge them.
#[derive(Debug, Clone)]
pub struct TestPlan {
    pub name: String,
    pub scenarios: Vec<Scenario>,
    pub thresholds: Vec<Threshold>,
}

impl TestPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scenarios: Vec::new(),
            thresholds: Vec::new(),
        }
    }

    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    /// Parses and adds thresholds for one metric selector.
    pub fn with_thresholds(
        mut self,
        selector: &str,
        expressions: &[&str],
    ) -> Result<Self, ThresholdParseError> {
        self.thresholds
            .extend(Threshold::parse_all(selector, expressions)?);
        Ok(self)
    }

    /// Validates every scenario and cross-checks threshold selectors.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut ctx = ValidationContext::new();

        if self.scenarios.is_empty() {
            ctx.add_error(ValidationError::RequiredField {
                field: "scenarios".to_string(),
            });
        }

        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            ctx.check(scenario.validate());
            if !names.insert(scenario.name.as_str()) {
                ctx.add_error(ValidationError::FieldError {
                    field: scenario.field_path(),
                    message: format!("duplicate scenario name '{}'", scenario.name),
                });
            }
        }

        for threshold in &self.thresholds {
            if let Some(scenario) = &threshold.metric.scenario {
                if !names.contains(scenario.as_str()) {
                    ctx.add_error(ValidationError::InvalidEnum {
                        field: format!("thresholds.{}", threshold.metric),
                        value: scenario.clone(),
                        expected: {
                            let mut known: Vec<&str> = names.iter().copied().collect();
                            known.sort_unstable();
                            known.join(", ")
                        },
                    });
                }
            }
        }

        ctx.into_result()
    }

    /// Latest point at which any scenario may still be running.
    pub fn hard_deadline(&self, tick: Duration) -> Duration {
        self.scenarios
            .iter()
            .map(|s| s.end_offset().saturating_add(s.graceful_stop))
            .max()
            .unwrap_or(Duration::ZERO)
            .saturating_add(tick.saturating_mul(2))
            .saturating_add(HARD_DEADLINE_SLACK)
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub plan: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub scenarios: Vec<ScenarioSummary>,
    pub snapshot: MetricsSnapshot,
    pub thresholds: ThresholdReport,
    pub interrupted: bool,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.thresholds.passed
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tick_interval: Duration,
    /// How often progress is logged and thresholds are checked mid-run.
    pub progress_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// Stops every scheduler of a run from outside, e.g. on Ctrl-C.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }
}

/// Sleeps until `deadline`, or forever when it lies past what `Instant` can hold.
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct ScenarioOrchestrator {
    metrics: Arc<MetricsAggregator>,
    issuer: Arc<dyn RequestIssuer>,
    config: OrchestratorConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ScenarioOrchestrator {
    pub fn new(
        metrics: Arc<MetricsAggregator>,
        issuer: Arc<dyn RequestIssuer>,
        config: OrchestratorConfig,
    ) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            metrics,
            issuer,
            config,
            shutdown: Arc::new(sender),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: Arc::clone(&self.shutdown),
        }
    }

    /// Runs every scenario of `plan` and judges the result.
    ///
    /// Fails before any request is sent if the plan is invalid. Request and
    /// capacity failures never surface here; they are in the metrics.
    pub async fn run_all(&self, plan: &TestPlan) -> Result<RunResult, RunError> {
        plan.validate()?;

        let mut prepared = Vec::with_capacity(plan.scenarios.len());
        for scenario in &plan.scenarios {
            let builtins = BuiltinMetrics::register(&self.metrics, &scenario.name)?;
            prepared.push((Arc::new(scenario.clone()), builtins));
        }

        let run_start = Instant::now();
        let started_at = Utc::now();
        let vu_ids = Arc::new(AtomicU64::new(0));
        info!(
            plan = %plan.name,
            scenarios = plan.scenarios.len(),
            thresholds = plan.thresholds.len(),
            "Run starting"
        );

        // Pools are built up front so a scenario cut off by the deadline can
        // still be accounted for after its task is gone.
        let mut started = Vec::with_capacity(prepared.len());
        let mut runs = JoinSet::new();
        for (scenario, builtins) in prepared {
            let metrics = Arc::clone(&self.metrics);
            let mut shutdown = self.shutdown.subscribe();
            let tick = self.config.tick_interval;

            let (pre_allocated, max) = scenario.load_model.pool_bounds();
            let pool = VuPool::new(
                scenario.name.clone(),
                pre_allocated,
                max,
                Arc::clone(&metrics),
                Arc::clone(&vu_ids),
            );
            let executor = Arc::new(IterationExecutor::new(
                Arc::clone(&scenario),
                builtins,
                Arc::clone(&self.issuer),
            ));
            started.push((Arc::clone(&executor), Arc::clone(&pool)));

            runs.spawn(async move {
                let begin = run_start + scenario.start_time;
                let interrupted = tokio::select! {
                    _ = time::sleep_until(begin) => false,
                    _ = stopped(&mut shutdown) => true,
                };
                if interrupted {
                    warn!(scenario = %scenario.name, "Run stopped before scenario started");
                    return ScenarioSummary::skipped(
                        &scenario.name,
                        &scenario.load_model,
                        scenario.start_time,
                    );
                }

                ScenarioRunner::new(executor, pool, metrics.recorder(), tick, shutdown, run_start)
                    .run()
                    .await
            });
        }

        let progress = self.spawn_progress(plan.thresholds.clone(), run_start);
        let deadline = run_start.checked_add(plan.hard_deadline(self.config.tick_interval));
        let mut summaries = Vec::with_capacity(plan.scenarios.len());

        loop {
            tokio::select! {
                joined = runs.join_next() => match joined {
                    Some(Ok(summary)) => summaries.push(summary),
                    Some(Err(e)) => {
                        error!(error = %e, "Scenario task failed");
                        progress.abort();
                        runs.abort_all();
                        return Err(RunError::SchedulerFault(e.to_string()));
                    }
                    None => break,
                },
                _ = sleep_until_deadline(deadline) => {
                    error!(remaining = runs.len(), "Hard run deadline exceeded; aborting scenarios");
                    runs.abort_all();
                    while runs.join_next().await.is_some() {}
                    break;
                }
            }
        }
        progress.abort();

        // Report in plan order; scenarios cut off by the deadline have no summary yet.
        let recorder = self.metrics.recorder();
        let scenarios: Vec<ScenarioSummary> = started
            .iter()
            .map(|(executor, pool)| {
                let name = &executor.scenario().name;
                summaries
                    .iter()
                    .find(|summary| &summary.name == name)
                    .cloned()
                    .unwrap_or_else(|| {
                        warn!(scenario = %name, "Scenario aborted at the hard run deadline");
                        ScenarioSummary::deadline_aborted(executor, pool, &recorder, run_start)
                    })
            })
            .collect();

        let snapshot = self.metrics.snapshot();
        let thresholds = ThresholdEvaluator::evaluate(&snapshot, &plan.thresholds);
        ThresholdEvaluator::log_report(&thresholds);

        let duration = run_start.elapsed();
        let interrupted = *self.shutdown.borrow() || scenarios.iter().any(|s| s.interrupted);
        info!(
            plan = %plan.name,
            duration_secs = duration.as_secs_f64(),
            passed = thresholds.passed,
            interrupted,
            "Run finished"
        );

        Ok(RunResult {
            plan: plan.name.clone(),
            started_at,
            duration,
            scenarios,
            snapshot,
            thresholds,
            interrupted,
        })
    }

    /// Periodic progress log with an informational threshold check.
    fn spawn_progress(&self, thresholds: Vec<Threshold>, run_start: Instant) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        let interval = self.config.progress_interval;

        tokio::spawn(async move {
            if interval.is_zero() {
                return;
            }
            let mut next = run_start + interval;
            loop {
                time::sleep_until(next).await;
                next += interval;

                let snapshot = metrics.snapshot();
                let report = ThresholdEvaluator::evaluate(&snapshot, &thresholds);
                let latency = snapshot
                    .select(&MetricKey::global(HTTP_REQ_DURATION))
                    .and_then(|series| series.trend().and_then(|t| t.stats()))
                    .map(|stats| stats.format())
                    .unwrap_or_default();
                info!(
                    elapsed_secs = run_start.elapsed().as_secs(),
                    requests = snapshot.counter_value(&MetricKey::global(HTTP_REQS)),
                    iterations = snapshot.counter_value(&MetricKey::global(ITERATIONS)),
                    dropped = snapshot.counter_value(&MetricKey::global(DROPPED_ITERATIONS)),
                    thresholds_failing = report.failures().count(),
                    http_req_duration = %latency,
                    "Progress"
                );
            }
        })
    }
}
