//! Pass/fail expressions over aggregated metrics.
//!
//! A threshold pairs a metric selector (`http_req_duration` or
//! `http_req_duration{scenario:singles}`) with an expression such as
//! `p(95)<800` or `rate<0.01`. Thresholds are parsed when a plan is built,
//! so a malformed one is a configuration failure rather than a run failure.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::{MetricKey, MetricsSnapshot, SeriesValues};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdParseError {
    #[error("empty threshold expression for '{metric}'")]
    Empty { metric: String },

    #[error("invalid threshold '{raw}' (missing operator)")]
    MissingOperator { raw: String },

    #[error("unknown aggregation '{aggregation}' in threshold '{raw}'")]
    UnknownAggregation { aggregation: String, raw: String },

    #[error("invalid percentile in threshold '{raw}': must be within [0, 100]")]
    InvalidPercentile { raw: String },

    #[error("invalid numeric bound in threshold '{raw}'")]
    InvalidBound { raw: String },

    #[error("invalid metric selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
}

impl Comparator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }

    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            Comparator::Lt => left < right,
            Comparator::Lte => left <= right,
            Comparator::Gt => left > right,
            Comparator::Gte => left >= right,
            Comparator::Eq => left == right,
            Comparator::Ne => left != right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Percentile(f64),
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Count => f.write_str("count"),
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

/// One parsed threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: MetricKey,
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub bound: f64,
    /// The expression as written.
    pub source: String,
}

impl Threshold {
    /// Parses `expression` against the metric named by `selector`.
    pub fn parse(selector: &str, expression: &str) -> Result<Self, ThresholdParseError> {
        let metric = parse_metric_selector(selector)?;

        let s: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        if s.is_empty() {
            return Err(ThresholdParseError::Empty {
                metric: selector.to_string(),
            });
        }

        // Two-character operators first so `<=` is not read as `<`.
        let ops = [
            ("<=", Comparator::Lte),
            (">=", Comparator::Gte),
            ("==", Comparator::Eq),
            ("!=", Comparator::Ne),
            ("<", Comparator::Lt),
            (">", Comparator::Gt),
        ];
        let (pos, len, comparator) = ops
            .iter()
            .find_map(|(tok, op)| s.find(tok).map(|pos| (pos, tok.len(), *op)))
            .ok_or_else(|| ThresholdParseError::MissingOperator {
                raw: expression.to_string(),
            })?;

        let (left, rest) = s.split_at(pos);
        let right = &rest[len..];
        if left.is_empty() || right.is_empty() {
            return Err(ThresholdParseError::MissingOperator {
                raw: expression.to_string(),
            });
        }

        let aggregation = parse_aggregation(left, expression)?;
        let bound: f64 = right
            .parse()
            .ok()
            .filter(|v: &f64| v.is_finite())
            .ok_or_else(|| ThresholdParseError::InvalidBound {
                raw: expression.to_string(),
            })?;

        Ok(Self {
            metric,
            aggregation,
            comparator,
            bound,
            source: expression.trim().to_string(),
        })
    }

    /// Parses every expression of one metric.
    pub fn parse_all(selector: &str, expressions: &[&str]) -> Result<Vec<Self>, ThresholdParseError> {
        expressions
            .iter()
            .map(|expr| Self::parse(selector, expr))
            .collect()
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.source)
    }
}

fn parse_aggregation(left: &str, raw: &str) -> Result<Aggregation, ThresholdParseError> {
    let agg = match left.to_ascii_lowercase().as_str() {
        "avg" => Aggregation::Avg,
        "min" => Aggregation::Min,
        "max" => Aggregation::Max,
        "med" => Aggregation::Med,
        "count" => Aggregation::Count,
        "rate" => Aggregation::Rate,
        other => {
            let inner = other
                .strip_prefix("p(")
                .and_then(|v| v.strip_suffix(')'))
                .ok_or_else(|| ThresholdParseError::UnknownAggregation {
                    aggregation: left.to_string(),
                    raw: raw.to_string(),
                })?;
            let p: f64 = inner
                .parse()
                .map_err(|_| ThresholdParseError::InvalidPercentile {
                    raw: raw.to_string(),
                })?;
            if !(0.0..=100.0).contains(&p) {
                return Err(ThresholdParseError::InvalidPercentile {
                    raw: raw.to_string(),
                });
            }
            Aggregation::Percentile(p)
        }
    };
    Ok(agg)
}

/// Parses `name` or `name{scenario:value}`.
pub fn parse_metric_selector(selector: &str) -> Result<MetricKey, ThresholdParseError> {
    let selector = selector.trim();
    let invalid = |message: &str| ThresholdParseError::InvalidSelector {
        selector: selector.to_string(),
        message: message.to_string(),
    };

    let (name, scenario) = match selector.find('{') {
        None => (selector, None),
        Some(open) => {
            let tags = selector[open + 1..]
                .strip_suffix('}')
                .ok_or_else(|| invalid("missing closing '}'"))?;
            let (tag, value) = tags
                .split_once(':')
                .ok_or_else(|| invalid("expected tag:value"))?;
            if tag.trim() != "scenario" {
                return Err(invalid("only the 'scenario' tag is supported"));
            }
            let value = value.trim();
            if value.is_empty() {
                return Err(invalid("empty scenario name"));
            }
            (&selector[..open], Some(value.to_string()))
        }
    };

    if name.is_empty() {
        return Err(invalid("empty metric name"));
    }

    Ok(MetricKey {
        name: name.to_string(),
        scenario,
    })
}

/// Outcome of one threshold.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    /// `None` when the metric does not exist or the aggregation does not
    /// apply to its kind; such a threshold fails.
    pub observed: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdReport {
    pub passed: bool,
    pub results: Vec<ThresholdResult>,
}

impl ThresholdReport {
    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Judges thresholds against a snapshot. Used for both the mid-run
/// progress check and the final verdict.
pub struct ThresholdEvaluator;

impl ThresholdEvaluator {
    pub fn evaluate(snapshot: &MetricsSnapshot, thresholds: &[Threshold]) -> ThresholdReport {
        let results: Vec<ThresholdResult> = thresholds
            .iter()
            .map(|t| {
                let observed = snapshot
                    .select(&t.metric)
                    .and_then(|series| observed_value(&series, t.aggregation));
                let passed = observed
                    .map(|v| t.comparator.holds(v, t.bound))
                    .unwrap_or(false);
                ThresholdResult {
                    metric: t.metric.to_string(),
                    expression: t.source.clone(),
                    observed,
                    passed,
                }
            })
            .collect();

        ThresholdReport {
            passed: results.iter().all(|r| r.passed),
            results,
        }
    }

    /// Logs every result: passes at info, failures at warn.
    pub fn log_report(report: &ThresholdReport) {
        for r in &report.results {
            if r.passed {
                info!(metric = %r.metric, expression = %r.expression, observed = ?r.observed, "Threshold passed");
            } else {
                warn!(metric = %r.metric, expression = %r.expression, observed = ?r.observed, "Threshold failed");
            }
        }
    }
}

fn observed_value(series: &SeriesValues, agg: Aggregation) -> Option<f64> {
    match (series, agg) {
        (SeriesValues::Trend(t), Aggregation::Avg) => t.mean(),
        (SeriesValues::Trend(t), Aggregation::Min) => t.min(),
        (SeriesValues::Trend(t), Aggregation::Max) => t.max(),
        (SeriesValues::Trend(t), Aggregation::Med) => t.percentile(50.0),
        (SeriesValues::Trend(t), Aggregation::Percentile(p)) => t.percentile(p),
        (SeriesValues::Trend(t), Aggregation::Count) => Some(t.count() as f64),

        (SeriesValues::Counter { value }, Aggregation::Count) => Some(*value as f64),

        (SeriesValues::Rate { .. }, Aggregation::Rate) => series.rate(),
        (SeriesValues::Rate { total, .. }, Aggregation::Count) => Some(*total as f64),

        _ => None,
    }
}
