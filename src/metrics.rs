//! Run-wide metrics aggregation.
//!
//! One [`MetricsAggregator`] exists per run and is handed explicitly to every
//! component that records. Metrics are registered up front and return typed
//! handles; recording goes through a [`Recorder`], which is pinned to one of
//! several independently locked shards so concurrent VUs do not queue behind
//! a single lock. Reads merge every shard into a [`MetricsSnapshot`].

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::RequestDiagnostic;
use crate::percentiles::{TrendDistribution, TrendStats};

/// How many failed-request diagnostics are kept for the report.
const MAX_DIAGNOSTICS: usize = 50;

/// The three metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonically increasing integer.
    Counter,
    /// Numeric distribution (percentiles, mean, extremes).
    Trend,
    /// Fraction of non-zero samples.
    Rate,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Trend => "trend",
            MetricKind::Rate => "rate",
        })
    }
}

/// Metric identity. Metrics recorded by a scenario carry its name so
/// scenarios never contaminate each other's series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricKey {
    pub name: String,
    pub scenario: Option<String>,
}

impl MetricKey {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scenario: None,
        }
    }

    pub fn scoped(name: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scenario: Some(scenario.into()),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scenario {
            Some(s) => write!(f, "{}{{scenario:{}}}", self.name, s),
            None => f.write_str(&self.name),
        }
    }
}

/// A single observation. Immutable once emitted.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub key: MetricKey,
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: Instant,
}

impl MetricSample {
    pub fn new(key: MetricKey, kind: MetricKind, value: f64) -> Self {
        Self {
            key,
            kind,
            value,
            timestamp: Instant::now(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("metric '{key}' is already registered as a {existing}, not a {requested}")]
    KindMismatch {
        key: String,
        existing: MetricKind,
        requested: MetricKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateHandle(usize);

#[derive(Default)]
struct Registry {
    ids: HashMap<MetricKey, usize>,
    defs: Vec<(MetricKey, MetricKind)>,
}

#[derive(Debug, Clone)]
enum SeriesData {
    Counter(u64),
    Trend(TrendDistribution),
    Rate { hits: u64, total: u64 },
}

impl SeriesData {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => SeriesData::Counter(0),
            MetricKind::Trend => SeriesData::Trend(TrendDistribution::new()),
            MetricKind::Rate => SeriesData::Rate { hits: 0, total: 0 },
        }
    }

    fn apply(&mut self, value: f64) {
        match self {
            SeriesData::Counter(c) => *c += value.max(0.0) as u64,
            SeriesData::Trend(t) => t.record_ms(value),
            SeriesData::Rate { hits, total } => {
                *total += 1;
                if value != 0.0 {
                    *hits += 1;
                }
            }
        }
    }
}

#[derive(Default)]
struct Shard {
    series: Vec<Option<SeriesData>>,
}

impl Shard {
    fn slot(&mut self, id: usize, kind: MetricKind) -> &mut SeriesData {
        if self.series.len() <= id {
            self.series.resize_with(id + 1, || None);
        }
        self.series[id].get_or_insert_with(|| SeriesData::empty(kind))
    }
}

#[derive(Default)]
struct Diagnostics {
    recent: VecDeque<RequestDiagnostic>,
    by_category: BTreeMap<String, u64>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Concurrent-safe collector for every metric of a run.
pub struct MetricsAggregator {
    registry: RwLock<Registry>,
    shards: Box<[Mutex<Shard>]>,
    next_shard: AtomicUsize,
    diagnostics: Mutex<Diagnostics>,
}

impl MetricsAggregator {
    /// Creates an aggregator with a shard count derived from the host's parallelism.
    pub fn new() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_shards(parallelism * 4)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            registry: RwLock::new(Registry::default()),
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            next_shard: AtomicUsize::new(0),
            diagnostics: Mutex::new(Diagnostics::default()),
        }
    }

    fn register(&self, key: MetricKey, kind: MetricKind) -> Result<usize, MetricError> {
        {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(&id) = registry.ids.get(&key) {
                return check_kind(&registry, id, kind);
            }
        }

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(&id) = registry.ids.get(&key) {
            return check_kind(&registry, id, kind);
        }

        let id = registry.defs.len();
        debug!(metric = %key, kind = %kind, id, "Registered metric");
        registry.ids.insert(key.clone(), id);
        registry.defs.push((key, kind));
        Ok(id)
    }

    pub fn counter(&self, key: MetricKey) -> Result<CounterHandle, MetricError> {
        self.register(key, MetricKind::Counter).map(CounterHandle)
    }

    pub fn trend(&self, key: MetricKey) -> Result<TrendHandle, MetricError> {
        self.register(key, MetricKind::Trend).map(TrendHandle)
    }

    pub fn rate(&self, key: MetricKey) -> Result<RateHandle, MetricError> {
        self.register(key, MetricKind::Rate).map(RateHandle)
    }

    /// A recorder pinned to the next shard, round-robin.
    pub fn recorder(self: &Arc<Self>) -> Recorder {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        Recorder {
            metrics: Arc::clone(self),
            shard,
        }
    }

    fn write(&self, shard: usize, id: usize, kind: MetricKind, value: f64) {
        lock(&self.shards[shard]).slot(id, kind).apply(value);
    }

    /// Records a free-standing sample, registering its metric on first use.
    pub fn record(&self, sample: &MetricSample) -> Result<(), MetricError> {
        let id = self.register(sample.key.clone(), sample.kind)?;
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.write(shard, id, sample.kind, sample.value);
        Ok(())
    }

    /// Keeps a failed-request diagnostic for the report.
    pub fn add_diagnostic(&self, diagnostic: RequestDiagnostic) {
        let mut diags = lock(&self.diagnostics);
        *diags
            .by_category
            .entry(diagnostic.category.label().to_string())
            .or_insert(0) += 1;
        if diags.recent.len() == MAX_DIAGNOSTICS {
            diags.recent.pop_front();
        }
        diags.recent.push_back(diagnostic);
    }

    /// A consistent view of every metric.
    ///
    /// All shards are held for the duration of the merge, so the snapshot
    /// reflects a single point between writes.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let guards: Vec<MutexGuard<'_, Shard>> = self.shards.iter().map(lock).collect();

        let mut series = BTreeMap::new();
        for (id, (key, kind)) in registry.defs.iter().enumerate() {
            let mut merged = SeriesData::empty(*kind);
            for shard in &guards {
                if let Some(Some(data)) = shard.series.get(id) {
                    merge_data(&mut merged, data);
                }
            }
            series.insert(key.clone(), SeriesValues::from(merged));
        }
        drop(guards);
        drop(registry);

        let diags = lock(&self.diagnostics);
        MetricsSnapshot {
            series,
            diagnostics: diags.recent.iter().cloned().collect(),
            errors_by_category: diags.by_category.clone(),
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn check_kind(registry: &Registry, id: usize, requested: MetricKind) -> Result<usize, MetricError> {
    let (key, existing) = &registry.defs[id];
    if *existing != requested {
        return Err(MetricError::KindMismatch {
            key: key.to_string(),
            existing: *existing,
            requested,
        });
    }
    Ok(id)
}

fn merge_data(into: &mut SeriesData, from: &SeriesData) {
    match (into, from) {
        (SeriesData::Counter(a), SeriesData::Counter(b)) => *a += b,
        (SeriesData::Trend(a), SeriesData::Trend(b)) => a.merge(b),
        (
            SeriesData::Rate { hits, total },
            SeriesData::Rate {
                hits: h2,
                total: t2,
            },
        ) => {
            *hits += h2;
            *total += t2;
        }
        _ => {}
    }
}

/// Handle used by one VU (or any single producer) to record metrics.
#[derive(Clone)]
pub struct Recorder {
    metrics: Arc<MetricsAggregator>,
    shard: usize,
}

impl Recorder {
    pub fn add(&self, counter: CounterHandle, n: u64) {
        self.metrics
            .write(self.shard, counter.0, MetricKind::Counter, n as f64);
    }

    pub fn observe(&self, trend: TrendHandle, value_ms: f64) {
        self.metrics
            .write(self.shard, trend.0, MetricKind::Trend, value_ms);
    }

    pub fn rate(&self, rate: RateHandle, hit: bool) {
        self.metrics.write(
            self.shard,
            rate.0,
            MetricKind::Rate,
            if hit { 1.0 } else { 0.0 },
        );
    }

    pub fn record(&self, sample: &MetricSample) -> Result<(), MetricError> {
        let id = self.metrics.register(sample.key.clone(), sample.kind)?;
        self.metrics
            .write(self.shard, id, sample.kind, sample.value);
        Ok(())
    }

    pub fn diagnostic(&self, diagnostic: RequestDiagnostic) {
        self.metrics.add_diagnostic(diagnostic);
    }
}

/// Aggregated values of one series.
#[derive(Debug, Clone)]
pub enum SeriesValues {
    Counter { value: u64 },
    Trend(TrendDistribution),
    Rate { hits: u64, total: u64 },
}

impl From<SeriesData> for SeriesValues {
    fn from(data: SeriesData) -> Self {
        match data {
            SeriesData::Counter(value) => SeriesValues::Counter { value },
            SeriesData::Trend(t) => SeriesValues::Trend(t),
            SeriesData::Rate { hits, total } => SeriesValues::Rate { hits, total },
        }
    }
}

impl SeriesValues {
    pub fn kind(&self) -> MetricKind {
        match self {
            SeriesValues::Counter { .. } => MetricKind::Counter,
            SeriesValues::Trend(_) => MetricKind::Trend,
            SeriesValues::Rate { .. } => MetricKind::Rate,
        }
    }

    /// Number of recorded samples (counter value for counters).
    pub fn count(&self) -> u64 {
        match self {
            SeriesValues::Counter { value } => *value,
            SeriesValues::Trend(t) => t.count(),
            SeriesValues::Rate { total, .. } => *total,
        }
    }

    pub fn rate(&self) -> Option<f64> {
        match self {
            SeriesValues::Rate { hits, total } if *total > 0 => {
                Some(*hits as f64 / *total as f64)
            }
            _ => None,
        }
    }

    pub fn trend(&self) -> Option<&TrendDistribution> {
        match self {
            SeriesValues::Trend(t) => Some(t),
            _ => None,
        }
    }

    fn merge(&mut self, other: &SeriesValues) {
        match (self, other) {
            (SeriesValues::Counter { value: a }, SeriesValues::Counter { value: b }) => *a += b,
            (SeriesValues::Trend(a), SeriesValues::Trend(b)) => a.merge(b),
            (
                SeriesValues::Rate { hits, total },
                SeriesValues::Rate {
                    hits: h2,
                    total: t2,
                },
            ) => {
                *hits += h2;
                *total += t2;
            }
            _ => {}
        }
    }

    pub fn summary_values(&self) -> SummaryValues {
        match self {
            SeriesValues::Counter { value } => SummaryValues::Counter { count: *value },
            SeriesValues::Trend(t) => SummaryValues::Trend(t.stats()),
            SeriesValues::Rate { hits, total } => SummaryValues::Rate {
                rate: self.rate(),
                passes: *hits,
                fails: total - hits,
            },
        }
    }
}

/// Serializable view of one series for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSummary {
    pub metric: String,
    pub name: String,
    pub scenario: Option<String>,
    pub kind: MetricKind,
    pub values: SummaryValues,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SummaryValues {
    Counter {
        count: u64,
    },
    Trend(Option<TrendStats>),
    Rate {
        rate: Option<f64>,
        passes: u64,
        fails: u64,
    },
}

/// Point-in-time, read-only view of all metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    series: BTreeMap<MetricKey, SeriesValues>,
    pub diagnostics: Vec<RequestDiagnostic>,
    pub errors_by_category: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn get(&self, key: &MetricKey) -> Option<&SeriesValues> {
        self.series.get(key)
    }

    /// Every series named `name`, across all scenarios, merged into one.
    pub fn merged(&self, name: &str) -> Option<SeriesValues> {
        let mut out: Option<SeriesValues> = None;
        for (_, values) in self.series.iter().filter(|(k, _)| k.name == name) {
            match out.as_mut() {
                Some(acc) if acc.kind() == values.kind() => acc.merge(values),
                Some(_) => {}
                None => out = Some(values.clone()),
            }
        }
        out
    }

    /// Resolves a selector: scenario-scoped keys match exactly, bare names merge.
    pub fn select(&self, key: &MetricKey) -> Option<SeriesValues> {
        match key.scenario {
            Some(_) => self.get(key).cloned(),
            None => self.merged(&key.name),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &MetricKey> {
        self.series.keys()
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.series.keys().map(|k| k.name.as_str()).collect()
    }

    pub fn counter_value(&self, key: &MetricKey) -> u64 {
        match self.select(key) {
            Some(SeriesValues::Counter { value }) => value,
            _ => 0,
        }
    }

    /// Per-scenario series followed by the merged total of every name.
    pub fn summaries(&self) -> Vec<SeriesSummary> {
        let mut out: Vec<SeriesSummary> = self
            .series
            .iter()
            .filter(|(k, _)| k.scenario.is_some())
            .map(|(k, v)| SeriesSummary {
                metric: k.to_string(),
                name: k.name.clone(),
                scenario: k.scenario.clone(),
                kind: v.kind(),
                values: v.summary_values(),
            })
            .collect();

        for name in self.names() {
            if let Some(v) = self.merged(name) {
                out.push(SeriesSummary {
                    metric: name.to_string(),
                    name: name.to_string(),
                    scenario: None,
                    kind: v.kind(),
                    values: v.summary_values(),
                });
            }
        }

        out
    }
}
