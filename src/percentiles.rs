//! Latency distributions backed by HDR Histogram.
//!
//! Trend metrics are recorded into many independent distributions (one per
//! metrics shard) and merged when a snapshot is taken. HdrHistogram merges
//! losslessly, and with 3 significant digits every reported percentile is
//! within 0.1% of the recorded value, regardless of sample count.
//!
//! Percentiles use the lower nearest-rank definition: for `n` samples the
//! value at 0-based rank `floor(q * (n - 1))` is returned.

use hdrhistogram::Histogram;
use serde::Serialize;
use tracing::warn;

/// Values are stored in microseconds; this is the largest representable one (1 hour).
const MAX_TRACKABLE_US: u64 = 3_600_000_000;

const SIGNIFICANT_DIGITS: u8 = 3;

/// Summary statistics of a trend, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl TrendStats {
    /// Format statistics as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "count={}, min={:.2}ms, max={:.2}ms, avg={:.2}ms, med={:.2}ms, p90={:.2}ms, p95={:.2}ms, p99={:.2}ms",
            self.count, self.min, self.max, self.avg, self.med, self.p90, self.p95, self.p99,
        )
    }

    /// Format statistics as a compact table row.
    pub fn format_table_row(&self, label: &str) -> String {
        format!(
            "{:<48} {:>8} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2}",
            label, self.count, self.avg, self.med, self.p90, self.p95, self.p99, self.max,
        )
    }

    pub fn table_header() -> String {
        format!(
            "{:<48} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}",
            "trend (ms)", "count", "avg", "med", "p90", "p95", "p99", "max"
        )
    }
}

/// A mergeable numeric distribution.
///
/// Exact count, sum, min and max are kept next to the histogram so that
/// `avg`, `min` and `max` carry no quantisation error.
#[derive(Debug, Clone)]
pub struct TrendDistribution {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendDistribution {
    pub fn new() -> Self {
        // Bounds and precision are constants that hdrhistogram accepts.
        let histogram = Histogram::new_with_bounds(1, MAX_TRACKABLE_US, SIGNIFICANT_DIGITS)
            .expect("constant histogram bounds are valid");

        Self {
            histogram,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Record a value in milliseconds.
    pub fn record_ms(&mut self, value_ms: f64) {
        if !value_ms.is_finite() {
            warn!(value_ms, "Ignoring non-finite trend sample");
            return;
        }

        let value_ms = value_ms.max(0.0);
        self.count += 1;
        self.sum += value_ms;
        self.min = self.min.min(value_ms);
        self.max = self.max.max(value_ms);

        // Clamp to the valid range (1μs to 1h)
        let us = ((value_ms * 1000.0).round() as u64).clamp(1, MAX_TRACKABLE_US);
        if let Err(e) = self.histogram.record(us) {
            warn!(value_us = us, error = %e, "Failed to record value in histogram");
        }
    }

    /// Fold another distribution into this one.
    pub fn merge(&mut self, other: &TrendDistribution) {
        if other.count == 0 {
            return;
        }
        if let Err(e) = self.histogram.add(&other.histogram) {
            warn!(error = %e, "Failed to merge histograms");
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Percentile `pct` in `[0, 100]`, in milliseconds.
    pub fn percentile(&self, pct: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }

        let q = (pct / 100.0).clamp(0.0, 1.0);
        let total = self.histogram.len();
        let rank = (q * total.saturating_sub(1) as f64).floor() as u64;
        if rank == 0 {
            return Some(self.min);
        }
        if rank + 1 >= total {
            return Some(self.max);
        }

        let mut seen = 0u64;
        for v in self.histogram.iter_recorded() {
            seen += v.count_at_value();
            if seen > rank {
                let us = self.histogram.median_equivalent(v.value_iterated_to());
                return Some(self.clamp_to_observed(us as f64 / 1000.0));
            }
        }

        Some(self.max)
    }

    // Quantisation can push a bucket's midpoint past the exact extremes.
    fn clamp_to_observed(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn stats(&self) -> Option<TrendStats> {
        if self.count == 0 {
            return None;
        }

        Some(TrendStats {
            count: self.count,
            min: self.min,
            max: self.max,
            avg: self.sum / self.count as f64,
            med: self.percentile(50.0)?,
            p90: self.percentile(90.0)?,
            p95: self.percentile(95.0)?,
            p99: self.percentile(99.0)?,
        })
    }
}

impl Default for TrendDistribution {
    fn default() -> Self {
        Self::new()
    }
}
