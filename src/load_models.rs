use std::fmt;
use tokio::time::Duration;

use crate::config_validation::{LoadModelValidator, RangeValidator, ValidationResult};

/// A time-bounded segment of a ramping executor.
///
/// The target is interpolated linearly from the previous stage's target (or
/// the executor's start value) to `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stage {
    /// Iterations per time unit for arrival-rate executors, concurrent VUs for `ramping-vus`.
    pub target: f64,
    pub duration: Duration,
}

impl Stage {
    pub fn new(target: f64, duration: Duration) -> Self {
        Self { target, duration }
    }
}

/// Piecewise-linear target curve built from a start value and ordered stages.
///
/// Boundaries are half-open: at the exact instant a stage ends, the next stage
/// is in effect, so a zero-duration stage jumps straight to its target. Once
/// every stage has elapsed the curve is implicitly zero.
#[derive(Debug, Clone)]
pub struct RampSchedule {
    start: f64,
    stages: Vec<Stage>,
    cumulative_ends: Vec<Duration>,
}

impl RampSchedule {
    pub fn new(start: f64, stages: Vec<Stage>) -> Self {
        let mut cumulative_ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for s in &stages {
            acc = acc.saturating_add(s.duration);
            cumulative_ends.push(acc);
        }

        Self {
            start,
            stages,
            cumulative_ends,
        }
    }

    /// A flat curve holding `value` for `duration`.
    pub fn flat(value: f64, duration: Duration) -> Self {
        Self::new(value, vec![Stage::new(value, duration)])
    }

    pub fn total_duration(&self) -> Duration {
        self.cumulative_ends
            .last()
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_done(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration()
    }

    /// Highest value the curve reaches, including its start.
    pub fn max_target(&self) -> f64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start, f64::max)
    }

    /// Index of the stage in effect at `elapsed`, `None` once the schedule is over.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let idx = self.cumulative_ends.partition_point(|end| *end <= elapsed);
        (idx < self.stages.len()).then_some(idx)
    }

    fn stage_bounds(&self, idx: usize) -> (Duration, f64, f64) {
        let stage_start = if idx == 0 {
            Duration::ZERO
        } else {
            self.cumulative_ends[idx - 1]
        };
        let start_target = if idx == 0 {
            self.start
        } else {
            self.stages[idx - 1].target
        };
        (stage_start, start_target, self.stages[idx].target)
    }

    /// Instantaneous target at `elapsed`.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let Some(idx) = self.stage_index_at(elapsed) else {
            return 0.0;
        };

        let (stage_start, from, to) = self.stage_bounds(idx);
        let duration = self.stages[idx].duration.as_secs_f64();
        let into = elapsed.saturating_sub(stage_start).as_secs_f64();

        linear_interpolate(from, to, into, duration)
    }

    /// Area under the curve from zero to `elapsed`, in target-seconds.
    ///
    /// For an arrival-rate curve expressed per second this is the exact number
    /// of iterations that should have started by `elapsed`.
    pub fn integral_to(&self, elapsed: Duration) -> f64 {
        let mut area = 0.0;

        for idx in 0..self.stages.len() {
            let (stage_start, from, to) = self.stage_bounds(idx);
            if elapsed <= stage_start {
                break;
            }

            let d = self.stages[idx].duration.as_secs_f64();
            if d <= 0.0 {
                continue;
            }

            let x = elapsed.saturating_sub(stage_start).as_secs_f64().min(d);
            area += from * x + (to - from) * x * x / (2.0 * d);
        }

        area
    }

    /// Earliest elapsed time at which the area under the curve reaches
    /// `area`, or `None` if the schedule ends first.
    ///
    /// Inverse of [`RampSchedule::integral_to`]; the arrival-rate dispatcher
    /// uses it to find when iteration `n` fell due.
    pub fn time_for_integral(&self, area: f64) -> Option<Duration> {
        if area <= 0.0 {
            return Some(Duration::ZERO);
        }

        let mut covered = 0.0;
        for idx in 0..self.stages.len() {
            let (stage_start, from, to) = self.stage_bounds(idx);
            let d = self.stages[idx].duration.as_secs_f64();
            if d <= 0.0 {
                continue;
            }

            let stage_area = (from + to) * d / 2.0;
            let remaining = area - covered;
            if remaining <= stage_area {
                // Root of from*x + (to - from)*x^2/(2d) = remaining, in the
                // form that stays stable when the slope is near zero.
                let a = (to - from) / (2.0 * d);
                let denom = from + (from * from + 4.0 * a * remaining).max(0.0).sqrt();
                if denom <= 0.0 {
                    return None;
                }
                let x = (2.0 * remaining / denom).clamp(0.0, d);
                return Some(stage_start + Duration::from_secs_f64(x));
            }
            covered += stage_area;
        }

        None
    }
}

fn linear_interpolate(from: f64, to: f64, elapsed: f64, duration: f64) -> f64 {
    if duration <= 0.0 {
        return to;
    }
    from + (to - from) * (elapsed / duration)
}

/// Executor kind names, as used in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    ConstantArrivalRate,
    RampingArrivalRate,
    RampingVus,
    ConstantVus,
    SharedIterations,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::ConstantArrivalRate => "constant-arrival-rate",
            ExecutorKind::RampingArrivalRate => "ramping-arrival-rate",
            ExecutorKind::RampingVus => "ramping-vus",
            ExecutorKind::ConstantVus => "constant-vus",
            ExecutorKind::SharedIterations => "shared-iterations",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a scenario shapes its load.
///
/// One variant per executor kind, each carrying only the fields it needs.
/// Arrival-rate variants own their pool bounds; the VU-driven variants derive
/// them from their concurrency targets.
#[derive(Debug, Clone)]
pub enum LoadModel {
    /// `rate` iterations start every `time_unit` for `duration`, regardless of
    /// how long each iteration takes.
    ConstantArrivalRate {
        rate: f64,
        time_unit: Duration,
        duration: Duration,
        pre_allocated_vus: u64,
        max_vus: u64,
    },

    /// Arrival rate interpolated from `start_rate` through `stages`.
    RampingArrivalRate {
        start_rate: f64,
        time_unit: Duration,
        stages: Vec<Stage>,
        pre_allocated_vus: u64,
        max_vus: u64,
    },

    /// Number of concurrently looping VUs interpolated from `start_vus` through `stages`.
    RampingVus { start_vus: u64, stages: Vec<Stage> },

    /// A fixed number of looping VUs for `duration`.
    ConstantVus { vus: u64, duration: Duration },

    /// `vus` looping VUs share a budget of `iterations`, bounded by `max_duration`.
    SharedIterations {
        vus: u64,
        iterations: u64,
        max_duration: Duration,
    },
}

impl LoadModel {
    pub fn kind(&self) -> ExecutorKind {
        match self {
            LoadModel::ConstantArrivalRate { .. } => ExecutorKind::ConstantArrivalRate,
            LoadModel::RampingArrivalRate { .. } => ExecutorKind::RampingArrivalRate,
            LoadModel::RampingVus { .. } => ExecutorKind::RampingVus,
            LoadModel::ConstantVus { .. } => ExecutorKind::ConstantVus,
            LoadModel::SharedIterations { .. } => ExecutorKind::SharedIterations,
        }
    }

    /// `(pre_allocated, max)` worker counts for this model's pool.
    pub fn pool_bounds(&self) -> (u64, u64) {
        match self {
            LoadModel::ConstantArrivalRate {
                pre_allocated_vus,
                max_vus,
                ..
            }
            | LoadModel::RampingArrivalRate {
                pre_allocated_vus,
                max_vus,
                ..
            } => (*pre_allocated_vus, *max_vus),
            LoadModel::RampingVus { start_vus, stages } => {
                let peak = stages
                    .iter()
                    .map(|s| s.target.ceil() as u64)
                    .fold(*start_vus, u64::max);
                (*start_vus, peak)
            }
            LoadModel::ConstantVus { vus, .. } | LoadModel::SharedIterations { vus, .. } => {
                (*vus, *vus)
            }
        }
    }

    /// How long the scheduler keeps starting iterations.
    pub fn duration(&self) -> Duration {
        match self {
            LoadModel::ConstantArrivalRate { duration, .. }
            | LoadModel::ConstantVus { duration, .. } => *duration,
            LoadModel::SharedIterations { max_duration, .. } => *max_duration,
            LoadModel::RampingArrivalRate { .. } | LoadModel::RampingVus { .. } => self
                .vu_schedule()
                .or_else(|| self.rate_schedule())
                .map(|s| s.total_duration())
                .unwrap_or(Duration::ZERO),
        }
    }

    /// Arrival-rate curve in iterations per second, for the rate-based executors.
    pub fn rate_schedule(&self) -> Option<RampSchedule> {
        match self {
            LoadModel::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                ..
            } => Some(RampSchedule::flat(
                per_second(*rate, *time_unit),
                *duration,
            )),
            LoadModel::RampingArrivalRate {
                start_rate,
                time_unit,
                stages,
                ..
            } => Some(RampSchedule::new(
                per_second(*start_rate, *time_unit),
                stages
                    .iter()
                    .map(|s| Stage::new(per_second(s.target, *time_unit), s.duration))
                    .collect(),
            )),
            _ => None,
        }
    }

    /// Desired-concurrency curve, for the VU-driven executors.
    pub fn vu_schedule(&self) -> Option<RampSchedule> {
        match self {
            LoadModel::RampingVus { start_vus, stages } => {
                Some(RampSchedule::new(*start_vus as f64, stages.clone()))
            }
            LoadModel::ConstantVus { vus, duration } => {
                Some(RampSchedule::flat(*vus as f64, *duration))
            }
            LoadModel::SharedIterations {
                vus, max_duration, ..
            } => Some(RampSchedule::flat(*vus as f64, *max_duration)),
            _ => None,
        }
    }

    /// Validates the executor-specific fields; `field` is the scenario's path.
    pub fn validate(&self, field: &str) -> ValidationResult<()> {
        match self {
            LoadModel::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
            } => {
                RangeValidator::validate_non_negative_f64(*rate, &format!("{}.rate", field))?;
                validate_time_unit(*time_unit, field)?;
                RangeValidator::validate_duration(
                    *duration,
                    1,
                    &format!("{}.duration", field),
                )?;
                LoadModelValidator::validate_pool(*pre_allocated_vus, *max_vus, field)
            }
            LoadModel::RampingArrivalRate {
                start_rate,
                time_unit,
                stages,
                pre_allocated_vus,
                max_vus,
            } => {
                RangeValidator::validate_non_negative_f64(
                    *start_rate,
                    &format!("{}.start_rate", field),
                )?;
                validate_time_unit(*time_unit, field)?;
                LoadModelValidator::validate_stages(stages, &format!("{}.stages", field))?;
                LoadModelValidator::validate_pool(*pre_allocated_vus, *max_vus, field)
            }
            LoadModel::RampingVus { stages, .. } => {
                LoadModelValidator::validate_stages(stages, &format!("{}.stages", field))?;
                let (pre, max) = self.pool_bounds();
                LoadModelValidator::validate_pool(pre, max, field)
            }
            LoadModel::ConstantVus { vus, duration } => {
                RangeValidator::validate_positive_u64(*vus, &format!("{}.vus", field))?;
                RangeValidator::validate_duration(
                    *duration,
                    1,
                    &format!("{}.duration", field),
                )
            }
            LoadModel::SharedIterations {
                vus,
                iterations,
                max_duration,
            } => {
                RangeValidator::validate_positive_u64(*vus, &format!("{}.vus", field))?;
                RangeValidator::validate_positive_u64(
                    *iterations,
                    &format!("{}.iterations", field),
                )?;
                RangeValidator::validate_duration(
                    *max_duration,
                    1,
                    &format!("{}.max_duration", field),
                )
            }
        }
    }
}

fn per_second(value: f64, time_unit: Duration) -> f64 {
    let secs = time_unit.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    value / secs
}

fn validate_time_unit(time_unit: Duration, field: &str) -> ValidationResult<()> {
    RangeValidator::validate_duration(time_unit, 1, &format!("{}.time_unit", field))
}
