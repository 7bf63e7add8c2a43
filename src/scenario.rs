//! Scenario definitions.
//!
//! A scenario pairs a [`LoadModel`] with the iteration function its virtual
//! users run. Scenarios are validated when they are built, so a plan that
//! reaches the orchestrator is always runnable.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config_validation::{RangeValidator, ValidationError, ValidationResult};
use crate::load_models::LoadModel;
use crate::worker::IterationContext;

/// Default time in-flight iterations get to finish once a scenario ends.
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// Think time configuration for realistic user behavior simulation.
///
/// # Examples
/// ```
/// use fxdeals_loadtest::scenario::ThinkTime;
/// use std::time::Duration;
///
/// // Fixed delay: always 1 second
/// let fixed = ThinkTime::Fixed(Duration::from_secs(1));
///
/// // Random delay: between 100 and 400 milliseconds
/// let random = ThinkTime::Random {
///     min: Duration::from_millis(100),
///     max: Duration::from_millis(400),
/// };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkTime {
    /// Fixed delay (always the same duration)
    Fixed(Duration),

    /// Random delay within a range (min to max, inclusive)
    Random { min: Duration, max: Duration },
}

impl ThinkTime {
    /// Random think time between two bounds given in milliseconds.
    pub fn between_ms(min_ms: u64, max_ms: u64) -> Self {
        ThinkTime::Random {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    /// Calculate the actual delay to apply.
    ///
    /// For Fixed, returns the fixed duration.
    /// For Random, returns a random duration between min and max.
    pub fn calculate_delay(&self) -> Duration {
        match self {
            ThinkTime::Fixed(duration) => *duration,
            ThinkTime::Random { min, max } => {
                use rand::Rng;
                let min_ms = min.as_millis() as u64;
                let max_ms = max.as_millis() as u64;

                if min_ms >= max_ms {
                    return *min;
                }

                let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
                Duration::from_millis(random_ms)
            }
        }
    }

    /// Upper bound of any delay this think time can produce.
    pub fn max_delay(&self) -> Duration {
        match self {
            ThinkTime::Fixed(d) => *d,
            ThinkTime::Random { min, max } => (*min).max(*max),
        }
    }
}

/// The unit of work a virtual user performs once per iteration.
///
/// Implementations receive an explicit [`IterationContext`] carrying the
/// worker identity, the metrics recorder and the request capability.
#[async_trait]
pub trait IterationFn: Send + Sync {
    async fn run(&self, ctx: &mut IterationContext<'_>);

    /// Pause applied after every iteration, inside the virtual user only.
    fn think_time(&self) -> Option<ThinkTime> {
        None
    }
}

/// A named, independently scheduled workload.
#[derive(Clone)]
pub struct Scenario {
    pub name: String,
    pub load_model: LoadModel,
    /// Offset from run start at which this scenario begins.
    pub start_time: Duration,
    /// Grace deadline for in-flight iterations after the last stage completes.
    pub graceful_stop: Duration,
    pub exec: Arc<dyn IterationFn>,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("load_model", &self.load_model)
            .field("start_time", &self.start_time)
            .field("graceful_stop", &self.graceful_stop)
            .finish_non_exhaustive()
    }
}

impl Scenario {
    /// Builds and validates a scenario.
    pub fn new(
        name: impl Into<String>,
        load_model: LoadModel,
        exec: Arc<dyn IterationFn>,
    ) -> ValidationResult<Self> {
        let scenario = Self {
            name: name.into(),
            load_model,
            start_time: Duration::ZERO,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            exec,
        };
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn with_start_time(mut self, start_time: Duration) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = graceful_stop;
        self
    }

    pub fn field_path(&self) -> String {
        format!("scenarios.{}", self.name)
    }

    pub fn validate(&self) -> ValidationResult<()> {
        // Scenario names end up inside metric selectors like `name{scenario:x}`.
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(ValidationError::InvalidFormat {
                field: "scenarios.name".to_string(),
                message: format!(
                    "scenario name '{}' must be non-empty and use only [A-Za-z0-9_-]",
                    self.name
                ),
            });
        }

        let field = self.field_path();
        RangeValidator::validate_duration(self.start_time, 0, &format!("{}.start_time", field))?;
        RangeValidator::validate_duration(
            self.graceful_stop,
            0,
            &format!("{}.graceful_stop", field),
        )?;
        self.load_model.validate(&field)
    }

    /// Time from run start until this scenario stops dispatching.
    pub fn end_offset(&self) -> Duration {
        self.start_time.saturating_add(self.load_model.duration())
    }
}
