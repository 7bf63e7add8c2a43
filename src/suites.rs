//! The deal-import test suites.
//!
//! Each suite is a [`TestPlan`] assembled from [`DealCall`] iteration
//! functions. Suite-specific trends and counters are registered on the run's
//! [`MetricsAggregator`] while the plan is built, scoped to the scenario that
//! records them.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

use crate::client::ApiRequest;
use crate::config::Config;
use crate::config_validation::ValidationError;
use crate::generator::{DealGenerator, DealOverrides};
use crate::load_models::{LoadModel, Stage};
use crate::metrics::{CounterHandle, MetricKey, MetricsAggregator, TrendHandle};
use crate::multi_scenario::{RunError, TestPlan};
use crate::scenario::{IterationFn, Scenario, ThinkTime};
use crate::worker::{IterationContext, HTTP_REQ_DURATION, HTTP_REQ_FAILED};

pub const CHECK_SINGLE_IMPORT: &str = "single import status is 201";
pub const CHECK_BATCH_IMPORT: &str = "batch import status is 201";
pub const CHECK_GET_ALL: &str = "get all deals status is 200";
pub const CHECK_HEALTH: &str = "health status 200";

const ONE_SECOND: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suite {
    Smoke,
    Healthcheck,
    LoadBatch,
    StressGetAll,
    Mixed,
    Seed,
}

impl Suite {
    pub fn as_str(&self) -> &'static str {
        match self {
            Suite::Smoke => "smoke",
            Suite::Healthcheck => "healthcheck",
            Suite::LoadBatch => "load-batch",
            Suite::StressGetAll => "stress-get-all",
            Suite::Mixed => "mixed",
            Suite::Seed => "seed",
        }
    }

    pub fn all() -> [Suite; 6] {
        [
            Suite::Smoke,
            Suite::Healthcheck,
            Suite::LoadBatch,
            Suite::StressGetAll,
            Suite::Mixed,
            Suite::Seed,
        ]
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Suite {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Suite::all()
            .into_iter()
            .find(|suite| suite.as_str() == wanted)
            .ok_or_else(|| ValidationError::InvalidEnum {
                field: "SUITE".to_string(),
                value: s.to_string(),
                expected: Suite::all()
                    .iter()
                    .map(Suite::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// The request an iteration performs.
#[derive(Debug, Clone)]
pub enum DealRequest {
    ImportSingle,
    ImportBatch { size: usize },
    GetAll,
    Health { path: String },
}

/// Suite metrics a [`DealCall`] feeds besides the built-ins.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallMetrics {
    pub latency: Option<TrendHandle>,
    pub succeeded: Option<CounterHandle>,
    pub failed: Option<CounterHandle>,
}

/// One API call per iteration, followed by an optional think time.
pub struct DealCall {
    request: DealRequest,
    generator: Arc<DealGenerator>,
    metrics: CallMetrics,
    think: Option<ThinkTime>,
}

impl DealCall {
    pub fn new(request: DealRequest, generator: Arc<DealGenerator>) -> Self {
        Self {
            request,
            generator,
            metrics: CallMetrics::default(),
            think: None,
        }
    }

    pub fn with_metrics(mut self, metrics: CallMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_think_time(mut self, think: ThinkTime) -> Self {
        self.think = Some(think);
        self
    }

    fn check(&self) -> (&'static str, u16) {
        match self.request {
            DealRequest::ImportSingle => (CHECK_SINGLE_IMPORT, 201),
            DealRequest::ImportBatch { .. } => (CHECK_BATCH_IMPORT, 201),
            DealRequest::GetAll => (CHECK_GET_ALL, 200),
            DealRequest::Health { .. } => (CHECK_HEALTH, 200),
        }
    }

    fn build_request(&self, ctx: &IterationContext<'_>) -> Result<ApiRequest, serde_json::Error> {
        match &self.request {
            DealRequest::ImportSingle => ApiRequest::import_single(
                &self
                    .generator
                    .generate_payload(ctx.identity(), DealOverrides::default()),
            ),
            DealRequest::ImportBatch { size } => {
                ApiRequest::import_batch(&self.generator.generate_batch(ctx.identity(), *size))
            }
            DealRequest::GetAll => Ok(ApiRequest::get_all_deals()),
            DealRequest::Health { path } => Ok(ApiRequest::health(path)),
        }
    }
}

#[async_trait]
impl IterationFn for DealCall {
    async fn run(&self, ctx: &mut IterationContext<'_>) {
        let (check, expected) = self.check();

        let request = match self.build_request(ctx) {
            Ok(request) => request,
            Err(e) => {
                ctx.fail(check, format!("failed to encode payload: {}", e));
                if let Some(failed) = self.metrics.failed {
                    ctx.recorder().add(failed, 1);
                }
                return;
            }
        };

        let outcome = ctx.request(&request, check, expected).await;

        let recorder = ctx.recorder();
        if let Some(latency) = self.metrics.latency {
            recorder.observe(latency, outcome.duration.as_secs_f64() * 1000.0);
        }
        match (outcome.passed, self.metrics.succeeded, self.metrics.failed) {
            (true, Some(succeeded), _) => recorder.add(succeeded, 1),
            (false, _, Some(failed)) => recorder.add(failed, 1),
            _ => {}
        }
    }

    fn think_time(&self) -> Option<ThinkTime> {
        self.think
    }
}

/// Builds plans for a run, registering suite metrics as it goes.
pub struct SuiteBuilder<'a> {
    config: &'a Config,
    metrics: &'a MetricsAggregator,
    generator: Arc<DealGenerator>,
}

impl<'a> SuiteBuilder<'a> {
    pub fn new(config: &'a Config, metrics: &'a MetricsAggregator) -> Self {
        Self {
            config,
            metrics,
            generator: Arc::new(DealGenerator::new(config.min_amount, config.max_amount)),
        }
    }

    pub fn build(&self, suite: Suite) -> Result<TestPlan, RunError> {
        let plan = match suite {
            Suite::Smoke => self.smoke()?,
            Suite::Healthcheck => self.healthcheck()?,
            Suite::LoadBatch => self.load_batch()?,
            Suite::StressGetAll => self.stress_get_all()?,
            Suite::Mixed => self.mixed()?,
            Suite::Seed => self.seed()?,
        };
        plan.validate()?;
        debug!(suite = %suite, scenarios = plan.scenarios.len(), thresholds = plan.thresholds.len(), "Plan built");
        Ok(plan)
    }

    fn trend(&self, name: &str, scenario: &str) -> Result<TrendHandle, RunError> {
        Ok(self.metrics.trend(MetricKey::scoped(name, scenario))?)
    }

    fn counter(&self, name: &str, scenario: &str) -> Result<CounterHandle, RunError> {
        Ok(self.metrics.counter(MetricKey::scoped(name, scenario))?)
    }

    fn scenario(
        &self,
        name: &str,
        load_model: LoadModel,
        exec: DealCall,
    ) -> Result<Scenario, RunError> {
        Ok(Scenario::new(name, load_model, Arc::new(exec))?
            .with_graceful_stop(self.config.graceful_stop))
    }

    fn call(&self, request: DealRequest) -> DealCall {
        DealCall::new(request, Arc::clone(&self.generator))
    }

    fn smoke(&self) -> Result<TestPlan, RunError> {
        let name = "smoke";
        let exec = self
            .call(DealRequest::ImportSingle)
            .with_metrics(CallMetrics {
                latency: Some(self.trend("smoke_single_import_latency", name)?),
                succeeded: Some(self.counter("smoke_single_import_created", name)?),
                failed: None,
            })
            .with_think_time(ThinkTime::between_ms(100, 500));
        let model = LoadModel::ConstantVus {
            vus: 1,
            duration: Duration::from_secs(30),
        };
        Ok(TestPlan::new(Suite::Smoke.as_str()).with_scenario(self.scenario(name, model, exec)?))
    }

    fn healthcheck(&self) -> Result<TestPlan, RunError> {
        let exec = self
            .call(DealRequest::Health {
                path: self.config.health_path.clone(),
            })
            .with_think_time(ThinkTime::Fixed(ONE_SECOND));
        let model = LoadModel::ConstantVus {
            vus: 1,
            duration: Duration::from_secs(30),
        };
        Ok(TestPlan::new(Suite::Healthcheck.as_str())
            .with_scenario(self.scenario("healthcheck", model, exec)?))
    }

    fn load_batch(&self) -> Result<TestPlan, RunError> {
        let name = "steady_batch";
        let settings = &self.config.load_batch;
        let exec = self
            .call(DealRequest::ImportBatch {
                size: self.config.batch_size,
            })
            .with_metrics(CallMetrics {
                latency: Some(self.trend("load_batch_import_latency", name)?),
                succeeded: Some(self.counter("load_batch_import_created", name)?),
                failed: None,
            })
            .with_think_time(ThinkTime::between_ms(100, 300));
        let model = LoadModel::ConstantArrivalRate {
            rate: settings.rate,
            time_unit: ONE_SECOND,
            duration: settings.duration,
            pre_allocated_vus: settings.vus,
            max_vus: settings.max_vus,
        };

        Ok(TestPlan::new(Suite::LoadBatch.as_str())
            .with_scenario(self.scenario(name, model, exec)?)
            .with_thresholds(HTTP_REQ_FAILED, &["rate<0.01"])?
            .with_thresholds(HTTP_REQ_DURATION, &["p(95)<800"])?)
    }

    fn stress_get_all(&self) -> Result<TestPlan, RunError> {
        let name = "stress";
        let exec = self
            .call(DealRequest::GetAll)
            .with_metrics(CallMetrics {
                latency: Some(self.trend("stress_get_all_latency", name)?),
                ..CallMetrics::default()
            })
            .with_think_time(ThinkTime::between_ms(50, 200));
        // One VU is up before the first ramp starts.
        let model = LoadModel::RampingVus {
            start_vus: 1,
            stages: vec![
                Stage::new(5.0, Duration::from_secs(30)),
                Stage::new(25.0, Duration::from_secs(60)),
                Stage::new(50.0, Duration::from_secs(60)),
                Stage::new(100.0, Duration::from_secs(60)),
                Stage::new(0.0, Duration::from_secs(30)),
            ],
        };
        Ok(TestPlan::new(Suite::StressGetAll.as_str())
            .with_scenario(self.scenario(name, model, exec)?))
    }

    fn mixed(&self) -> Result<TestPlan, RunError> {
        let singles = &self.config.singles;
        let singles_exec = self
            .call(DealRequest::ImportSingle)
            .with_metrics(CallMetrics {
                latency: Some(self.trend("mixed_single_import_latency", "singles")?),
                succeeded: Some(self.counter("mixed_single_created", "singles")?),
                failed: Some(self.counter("mixed_single_failed", "singles")?),
            })
            .with_think_time(ThinkTime::between_ms(100, 400));
        let singles_model = LoadModel::RampingArrivalRate {
            start_rate: singles.start_rate,
            time_unit: ONE_SECOND,
            stages: vec![
                Stage::new(singles.stage1, singles.stage1_duration),
                Stage::new(singles.stage2, singles.stage2_duration),
                Stage::new(0.0, singles.ramp_down_duration),
            ],
            pre_allocated_vus: singles.vus,
            max_vus: singles.max_vus,
        };

        let batches = &self.config.batches;
        let batches_exec = self
            .call(DealRequest::ImportBatch {
                size: self.config.batch_size,
            })
            .with_metrics(CallMetrics {
                latency: Some(self.trend("mixed_batch_import_latency", "batches")?),
                succeeded: Some(self.counter("mixed_batch_created", "batches")?),
                failed: Some(self.counter("mixed_batch_failed", "batches")?),
            })
            .with_think_time(ThinkTime::between_ms(100, 300));
        let batches_model = LoadModel::ConstantArrivalRate {
            rate: batches.rate,
            time_unit: ONE_SECOND,
            duration: batches.duration,
            pre_allocated_vus: batches.vus,
            max_vus: batches.max_vus,
        };

        let reads = &self.config.reads;
        let reads_exec = self
            .call(DealRequest::GetAll)
            .with_metrics(CallMetrics {
                latency: Some(self.trend("mixed_get_all_latency", "reads")?),
                succeeded: None,
                failed: Some(self.counter("mixed_reads_failed", "reads")?),
            })
            .with_think_time(ThinkTime::between_ms(50, 200));
        let reads_model = LoadModel::RampingVus {
            start_vus: 0,
            stages: vec![
                Stage::new(reads.stage1 as f64, reads.stage1_duration),
                Stage::new(reads.stage2 as f64, reads.stage2_duration),
                Stage::new(0.0, reads.ramp_down_duration),
            ],
        };

        Ok(TestPlan::new(Suite::Mixed.as_str())
            .with_scenario(self.scenario("singles", singles_model, singles_exec)?)
            .with_scenario(
                self.scenario("batches", batches_model, batches_exec)?
                    .with_start_time(Duration::from_secs(10)),
            )
            .with_scenario(
                self.scenario("reads", reads_model, reads_exec)?
                    .with_start_time(Duration::from_secs(5)),
            )
            .with_thresholds(HTTP_REQ_FAILED, &["rate<0.02"])?
            .with_thresholds("mixed_single_import_latency", &["p(95)<800", "p(99)<1500"])?
            .with_thresholds("mixed_batch_import_latency", &["p(95)<1200", "p(99)<2500"])?
            .with_thresholds("mixed_get_all_latency", &["p(95)<500", "p(99)<1000"])?)
    }

    fn seed(&self) -> Result<TestPlan, RunError> {
        let name = "seed";
        let exec = self
            .call(DealRequest::ImportSingle)
            .with_metrics(CallMetrics {
                latency: None,
                succeeded: Some(self.counter("seed_created", name)?),
                failed: Some(self.counter("seed_failed", name)?),
            })
            .with_think_time(ThinkTime::between_ms(10, 50));
        // One VU works through the whole budget; bound it generously.
        let model = LoadModel::SharedIterations {
            vus: 1,
            iterations: self.config.seed_count,
            max_duration: Duration::from_secs(600),
        };
        Ok(TestPlan::new(Suite::Seed.as_str()).with_scenario(self.scenario(name, model, exec)?))
    }
}
