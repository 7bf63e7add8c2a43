//! End-of-run outputs: the JSON summary, a Prometheus text dump of the final
//! snapshot, and the table printed to stdout.

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::errors::RequestDiagnostic;
use crate::metrics::{MetricKind, MetricsSnapshot, SeriesSummary, SeriesValues, SummaryValues};
use crate::multi_scenario::RunResult;
use crate::percentiles::TrendStats;
use crate::scheduler::ScenarioSummary;
use crate::thresholds::ThresholdResult;
use crate::utils::format_duration;

/// Namespace of every exported Prometheus family.
pub const METRIC_NAMESPACE: &str = "fxdeals_loadtest";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize run summary: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to encode metrics: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// The serialized run summary.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub suite: String,
    pub started_at: String,
    pub duration_secs: f64,
    pub passed: bool,
    pub interrupted: bool,
    pub scenarios: Vec<ScenarioSummary>,
    pub metrics: Vec<SeriesSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub errors_by_category: BTreeMap<String, u64>,
    pub diagnostics: Vec<RequestDiagnostic>,
}

impl RunReport {
    pub fn from_result(result: &RunResult) -> Self {
        Self {
            suite: result.plan.clone(),
            started_at: result.started_at.to_rfc3339(),
            duration_secs: result.duration.as_secs_f64(),
            passed: result.passed(),
            interrupted: result.interrupted,
            scenarios: result.scenarios.clone(),
            metrics: result.snapshot.summaries(),
            thresholds: result.thresholds.results.clone(),
            errors_by_category: result.snapshot.errors_by_category.clone(),
            diagnostics: result.snapshot.diagnostics.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Renders a snapshot in the Prometheus text exposition format.
///
/// Every metric name becomes one gauge family labelled by `scenario` and
/// `stat`; merged totals use `scenario="all"`. A fresh registry is used per
/// call so nothing leaks between runs.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> Result<String, ReportError> {
    let registry = Registry::new();

    for name in snapshot.names() {
        let family = GaugeVec::new(
            Opts::new(sanitize_metric_name(name), format!("{} (final snapshot)", name))
                .namespace(METRIC_NAMESPACE),
            &["scenario", "stat"],
        )?;
        registry.register(Box::new(family.clone()))?;

        for key in snapshot.keys().filter(|k| k.name == name) {
            if let (Some(scenario), Some(values)) = (&key.scenario, snapshot.get(key)) {
                export_series(&family, scenario, values);
            }
        }
        if let Some(merged) = snapshot.merged(name) {
            export_series(&family, "all", &merged);
        }
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn export_series(family: &GaugeVec, scenario: &str, values: &SeriesValues) {
    let set = |stat: &str, v: f64| family.with_label_values(&[scenario, stat]).set(v);

    match values {
        SeriesValues::Counter { value } => set("count", *value as f64),
        SeriesValues::Rate { hits, total } => {
            set("rate", values.rate().unwrap_or(0.0));
            set("passes", *hits as f64);
            set("fails", (total - hits) as f64);
        }
        SeriesValues::Trend(t) => {
            if let Some(stats) = t.stats() {
                set("count", stats.count as f64);
                set("avg", stats.avg);
                set("min", stats.min);
                set("med", stats.med);
                set("max", stats.max);
                set("p90", stats.p90);
                set("p95", stats.p95);
                set("p99", stats.p99);
            }
        }
    }
}

fn sanitize_metric_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Writes `{suite}-summary.json` and `{suite}-metrics.prom` into `dir`,
/// creating it if needed. Returns the written paths.
pub fn write_reports(
    dir: &Path,
    result: &RunResult,
) -> Result<(PathBuf, PathBuf), ReportError> {
    fs::create_dir_all(dir).map_err(|source| ReportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let report = RunReport::from_result(result);
    let summary_path = dir.join(format!("{}-summary.json", result.plan));
    write_file(&summary_path, &report.to_json()?)?;

    let prom_path = dir.join(format!("{}-metrics.prom", result.plan));
    write_file(&prom_path, &render_prometheus(&result.snapshot)?)?;

    info!(
        summary = %summary_path.display(),
        metrics = %prom_path.display(),
        "Reports written"
    );
    Ok((summary_path, prom_path))
}

fn write_file(path: &Path, contents: &str) -> Result<(), ReportError> {
    fs::write(path, contents).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Human-readable end-of-run summary.
pub fn render_summary_table(result: &RunResult) -> String {
    let mut out = String::new();
    let snapshot = &result.snapshot;

    out.push_str(&format!(
        "\n=== {} | {} | {} ===\n\n",
        result.plan,
        format_duration(result.duration),
        if result.passed() { "PASSED" } else { "FAILED" }
    ));

    out.push_str(&format!(
        "{:<16} {:<22} {:>10} {:>10} {:>8} {:>8} {:>8} {:>9}  {}\n",
        "scenario", "executor", "dispatched", "completed", "failed", "dropped", "peak_vu", "iter/s",
        "state"
    ));
    for s in &result.scenarios {
        out.push_str(&format!(
            "{:<16} {:<22} {:>10} {:>10} {:>8} {:>8} {:>8} {:>9.2}  {}\n",
            s.name,
            s.executor,
            s.dispatched,
            s.completed,
            s.failed,
            s.dropped,
            s.peak_vus,
            s.achieved_rate,
            s.state()
        ));
    }

    out.push('\n');
    out.push_str(&TrendStats::table_header());
    out.push('\n');
    for summary in snapshot.summaries() {
        if let SummaryValues::Trend(Some(stats)) = &summary.values {
            out.push_str(&stats.format_table_row(&summary.metric));
            out.push('\n');
        }
    }

    out.push('\n');
    for summary in snapshot.summaries() {
        if summary.scenario.is_some() {
            continue;
        }
        match summary.kind {
            MetricKind::Counter => {
                out.push_str(&format!(
                    "{:<48} {}\n",
                    summary.metric,
                    snapshot_count(snapshot, &summary.name)
                ));
            }
            MetricKind::Rate => {
                if let Some(SeriesValues::Rate { hits, total }) = snapshot.merged(&summary.name) {
                    let rate = if total > 0 { hits as f64 / total as f64 } else { 0.0 };
                    out.push_str(&format!(
                        "{:<48} {:>6.2}% ({} of {})\n",
                        summary.metric,
                        rate * 100.0,
                        hits,
                        total
                    ));
                }
            }
            MetricKind::Trend => {}
        }
    }

    if !result.thresholds.results.is_empty() {
        out.push_str("\nthresholds:\n");
        for r in &result.thresholds.results {
            out.push_str(&format!(
                "  {} {:<48} {:<16} observed={}\n",
                if r.passed { "ok  " } else { "FAIL" },
                r.metric,
                r.expression,
                r.observed
                    .map(|v| format!("{:.4}", v))
                    .unwrap_or_else(|| "n/a".to_string())
            ));
        }
    }

    if !snapshot.errors_by_category.is_empty() {
        out.push_str("\nerrors:\n");
        for (category, count) in &snapshot.errors_by_category {
            out.push_str(&format!("  {:<24} {}\n", category, count));
        }
    }

    out
}

fn snapshot_count(snapshot: &MetricsSnapshot, name: &str) -> u64 {
    match snapshot.merged(name) {
        Some(SeriesValues::Counter { value }) => value,
        _ => 0,
    }
}
