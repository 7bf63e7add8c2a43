//! Scenario and configuration validation.
//!
//! Invalid scenario definitions are configuration failures: they are detected
//! before a run begins and always name the offending field.

use thiserror::Error;
use tokio::time::Duration;

use crate::load_models::Stage;

/// Upper bound for every configured duration.
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}' is required but not provided")]
    RequiredField { field: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid format - {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}': invalid enum value '{value}'. Expected one of: {expected}")]
    InvalidEnum {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

impl ValidationError {
    /// The field path this error refers to, if it refers to exactly one.
    pub fn field(&self) -> Option<&str> {
        match self {
            ValidationError::FieldError { field, .. }
            | ValidationError::RequiredField { field }
            | ValidationError::OutOfRange { field, .. }
            | ValidationError::InvalidFormat { field, .. }
            | ValidationError::InvalidEnum { field, .. } => Some(field),
            ValidationError::Multiple(_) => None,
        }
    }
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Collects every problem instead of stopping at the first one, so a broken
/// plan is reported in full.
#[derive(Default)]
pub struct ValidationContext {
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Record the error of a fallible check, if any.
    pub fn check(&mut self, result: ValidationResult<()>) {
        if let Err(e) = result {
            self.add_error(e);
        }
    }

    /// Consume the context and return a result.
    ///
    /// A single error is returned as-is so callers can still inspect its field.
    pub fn into_result(mut self) -> Result<(), ValidationError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => {
                let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
                Err(ValidationError::Multiple(messages.join("; ")))
            }
        }
    }
}

/// Validator for URLs.
pub struct UrlValidator;

impl UrlValidator {
    pub fn validate(url: &str, field: &str) -> ValidationResult<()> {
        if url.is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: "URL cannot be empty".to_string(),
            });
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: format!("URL must start with http:// or https://, got: {}", url),
            });
        }

        if url.contains(' ') {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: "URL cannot contain spaces".to_string(),
            });
        }

        Ok(())
    }
}

/// Validator for numeric ranges.
pub struct RangeValidator;

impl RangeValidator {
    pub fn validate_u64(value: u64, min: u64, max: u64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_positive_u64(value: u64, field: &str) -> ValidationResult<()> {
        if value == 0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_non_negative_f64(value: f64, field: &str) -> ValidationResult<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: "0.0".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }

    /// Durations must fit in [`MAX_DURATION`]; `min_ms` is the smallest
    /// accepted value in milliseconds.
    pub fn validate_duration(value: Duration, min_ms: u64, field: &str) -> ValidationResult<()> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        Self::validate_u64(ms, min_ms, MAX_DURATION.as_millis() as u64, field)
    }
}

/// Validator for the executor-specific parts of a scenario.
pub struct LoadModelValidator;

impl LoadModelValidator {
    /// Ramping executors need at least one stage, and every stage target must be usable.
    pub fn validate_stages(stages: &[Stage], field: &str) -> ValidationResult<()> {
        if stages.is_empty() {
            return Err(ValidationError::FieldError {
                field: field.to_string(),
                message: "stage list cannot be empty for a ramping executor".to_string(),
            });
        }

        for (idx, stage) in stages.iter().enumerate() {
            RangeValidator::validate_non_negative_f64(
                stage.target,
                &format!("{}[{}].target", field, idx),
            )?;
            RangeValidator::validate_duration(
                stage.duration,
                0,
                &format!("{}[{}].duration", field, idx),
            )?;
        }

        Ok(())
    }

    /// `pre_allocated_vus <= max_vus`, and a pool must hold at least one worker.
    pub fn validate_pool(pre_allocated: u64, max: u64, field: &str) -> ValidationResult<()> {
        RangeValidator::validate_positive_u64(max, &format!("{}.max_vus", field))?;

        if max < pre_allocated {
            return Err(ValidationError::FieldError {
                field: format!("{}.max_vus", field),
                message: format!(
                    "max_vus ({}) must be greater than or equal to pre_allocated_vus ({})",
                    max, pre_allocated
                ),
            });
        }

        Ok(())
    }

    pub fn validate_amount_range(min: f64, max: f64) -> ValidationResult<()> {
        RangeValidator::validate_non_negative_f64(min, "MIN_AMOUNT")?;
        RangeValidator::validate_non_negative_f64(max, "MAX_AMOUNT")?;

        // Both bounds must leave at least one whole cent between them.
        if (min * 100.0).ceil() > (max * 100.0).floor() {
            return Err(ValidationError::FieldError {
                field: "MAX_AMOUNT".to_string(),
                message: format!(
                    "amount range [{}, {}] does not contain a two-decimal value",
                    min, max
                ),
            });
        }

        Ok(())
    }
}
