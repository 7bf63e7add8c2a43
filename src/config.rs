use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tokio::time::Duration;

use crate::client::{ClientConfig, DEFAULT_HEALTH_PATH};
use crate::config_validation::{
    LoadModelValidator, RangeValidator, UrlValidator, ValidationContext, ValidationError,
};
use crate::multi_scenario::OrchestratorConfig;
use crate::utils::{format_duration, parse_duration_string};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}'. {message}")]
    InvalidValue {
        var: String,
        value: String,
        message: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// Anything other than `json` selects the human formatter.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        })
    }
}

/// A constant-arrival-rate workload (`load-batch`, mixed `batches`).
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalSettings {
    pub rate: f64,
    pub duration: Duration,
    pub vus: u64,
    pub max_vus: u64,
}

/// The mixed suite's `singles` ramping-arrival-rate scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct SinglesSettings {
    pub start_rate: f64,
    pub stage1: f64,
    pub stage2: f64,
    pub stage1_duration: Duration,
    pub stage2_duration: Duration,
    pub ramp_down_duration: Duration,
    pub vus: u64,
    pub max_vus: u64,
}

/// The mixed suite's `reads` ramping-vus scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadsSettings {
    pub stage1: u64,
    pub stage2: u64,
    pub stage1_duration: Duration,
    pub stage2_duration: Duration,
    pub ramp_down_duration: Duration,
}

/// Main configuration for a run. Every field has a default; only malformed
/// values are errors.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub health_path: String,
    pub output_dir: PathBuf,
    pub suite: String,
    pub batch_size: usize,
    pub seed_count: u64,
    pub load_batch: ArrivalSettings,
    pub singles: SinglesSettings,
    pub batches: ArrivalSettings,
    pub reads: ReadsSettings,
    pub min_amount: f64,
    pub max_amount: f64,
    pub tick_interval: Duration,
    pub graceful_stop: Duration,
    pub request_timeout: Duration,
    pub log_format: LogFormat,
}

/// Reads variables through a lookup function so tests need not touch the
/// process environment.
struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, var: &str, default: &str) -> String {
        self.raw(var).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, var: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.raw(var) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                var: var.to_string(),
                message: e.to_string(),
                value,
            }),
        }
    }

    fn duration(&self, var: &str, default: &str) -> Result<Duration, ConfigError> {
        let value = self.string(var, default);
        parse_duration_string(&value).map_err(|message| ConfigError::InvalidValue {
            var: var.to_string(),
            value,
            message,
        })
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        let config = Config {
            base_url: env.string("BASE_URL", "http://localhost:8080"),
            health_path: env.string("HEALTH_PATH", DEFAULT_HEALTH_PATH),
            output_dir: PathBuf::from(env.string("OUTPUT_DIR", "results")),
            suite: env.string("SUITE", "mixed"),
            batch_size: env.parsed("BATCH", 10)?,
            seed_count: env.parsed("SEED_COUNT", 50)?,
            load_batch: ArrivalSettings {
                rate: env.parsed("RATE", 10.0)?,
                duration: env.duration("DURATION", "2m")?,
                vus: env.parsed("VUS", 10)?,
                max_vus: env.parsed("MAX_VUS", 50)?,
            },
            singles: SinglesSettings {
                start_rate: env.parsed("SINGLES_START_RATE", 2.0)?,
                stage1: env.parsed("SINGLES_STAGE1", 5.0)?,
                stage2: env.parsed("SINGLES_STAGE2", 10.0)?,
                stage1_duration: env.duration("SINGLES_STAGE1_DURATION", "30s")?,
                stage2_duration: env.duration("SINGLES_STAGE2_DURATION", "1m")?,
                ramp_down_duration: env.duration("SINGLES_RAMP_DOWN_DURATION", "15s")?,
                vus: env.parsed("SINGLES_VUS", 10)?,
                max_vus: env.parsed("SINGLES_MAX_VUS", 50)?,
            },
            batches: ArrivalSettings {
                rate: env.parsed("BATCH_RATE", 2.0)?,
                duration: env.duration("BATCH_DURATION", "1m")?,
                vus: env.parsed("BATCH_VUS", 10)?,
                max_vus: env.parsed("BATCH_MAX_VUS", 30)?,
            },
            reads: ReadsSettings {
                stage1: env.parsed("READS_STAGE1", 10)?,
                stage2: env.parsed("READS_STAGE2", 20)?,
                stage1_duration: env.duration("READS_STAGE1_DURATION", "30s")?,
                stage2_duration: env.duration("READS_STAGE2_DURATION", "1m")?,
                ramp_down_duration: env.duration("READS_RAMP_DOWN_DURATION", "30s")?,
            },
            min_amount: env.parsed("MIN_AMOUNT", 10.0)?,
            max_amount: env.parsed("MAX_AMOUNT", 100_000.0)?,
            tick_interval: env.duration("TICK_INTERVAL", "50ms")?,
            graceful_stop: env.duration("GRACEFUL_STOP", "30s")?,
            request_timeout: env.duration("REQUEST_TIMEOUT", "30s")?,
            log_format: env.parsed("LOG_FORMAT", LogFormat::Text)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks values that parse but cannot drive a run.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut ctx = ValidationContext::new();
        ctx.check(UrlValidator::validate(&self.base_url, "BASE_URL"));
        if !self.health_path.starts_with('/') {
            ctx.add_error(ValidationError::InvalidFormat {
                field: "HEALTH_PATH".to_string(),
                message: format!("'{}' must start with '/'", self.health_path),
            });
        }
        ctx.check(RangeValidator::validate_positive_u64(
            self.batch_size as u64,
            "BATCH",
        ));
        ctx.check(RangeValidator::validate_positive_u64(
            self.seed_count,
            "SEED_COUNT",
        ));
        ctx.check(LoadModelValidator::validate_amount_range(
            self.min_amount,
            self.max_amount,
        ));

        let durations = [
            ("DURATION", self.load_batch.duration, 1),
            ("SINGLES_STAGE1_DURATION", self.singles.stage1_duration, 0),
            ("SINGLES_STAGE2_DURATION", self.singles.stage2_duration, 0),
            ("SINGLES_RAMP_DOWN_DURATION", self.singles.ramp_down_duration, 0),
            ("BATCH_DURATION", self.batches.duration, 1),
            ("READS_STAGE1_DURATION", self.reads.stage1_duration, 0),
            ("READS_STAGE2_DURATION", self.reads.stage2_duration, 0),
            ("READS_RAMP_DOWN_DURATION", self.reads.ramp_down_duration, 0),
            ("TICK_INTERVAL", self.tick_interval, 1),
            ("GRACEFUL_STOP", self.graceful_stop, 0),
            ("REQUEST_TIMEOUT", self.request_timeout, 1),
        ];
        for (var, value, min_ms) in durations {
            ctx.check(RangeValidator::validate_duration(value, min_ms, var));
        }
        ctx.into_result()
    }

    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: self.request_timeout,
            ..ClientConfig::default()
        }
    }

    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            tick_interval: self.tick_interval,
            ..OrchestratorConfig::default()
        }
    }

    /// Prints the configuration summary.
    pub fn print_summary(&self, suite: &str) {
        println!("Starting load test:");
        println!("  Suite: {}", suite);
        println!("  Base URL: {}", self.base_url);
        println!("  Output directory: {}", self.output_dir.display());
        println!("  Batch size: {}", self.batch_size);
        println!(
            "  Deal amounts: {:.2} - {:.2}",
            self.min_amount, self.max_amount
        );
        println!(
            "  Tick interval: {}, graceful stop: {}, request timeout: {}",
            format_duration(self.tick_interval),
            format_duration(self.graceful_stop),
            format_duration(self.request_timeout)
        );
    }
}
