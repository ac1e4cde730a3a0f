use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Current value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
    Histogram(HistogramSummary),
}

/// One labelled series as reported by [`MetricsRecorder::snapshot`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    pub value: MetricValue,
}

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge holding an f64 as raw bits.
struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }
    fn set(&self, v: f64) {
        self.bits.store(v.to_bits(), Ordering::Relaxed);
    }
    fn add(&self, delta: f64) {
        let _ = self
            .bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((f64::from_bits(current) + delta).to_bits())
            });
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

struct Histogram {
    observations: Mutex<Vec<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(Vec::new()),
        }
    }
    fn observe(&self, value: f64) {
        self.observations.lock().push(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.total_cmp(b));
        let count = obs.len();
        let rank = |q: f64| obs[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: obs.iter().sum(),
            min: obs[0],
            max: obs[count - 1],
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Series identity. Labels are kept sorted so call-site order does not matter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn sample(&self, metric_type: MetricType, value: MetricValue) -> MetricSample {
        MetricSample {
            name: self.name.clone(),
            labels: self.labels.iter().cloned().collect(),
            metric_type,
            value,
        }
    }
}

/// Process-local counters, gauges and histograms.
///
/// Lookups take a read lock; a write lock is only taken the first time a
/// series is seen.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

fn with_series<T, R>(
    map: &RwLock<HashMap<MetricKey, T>>,
    key: MetricKey,
    init: fn() -> T,
    f: impl FnOnce(&T) -> R,
) -> R {
    {
        let read = map.read();
        if let Some(series) = read.get(&key) {
            return f(series);
        }
    }
    let mut write = map.write();
    f(write.entry(key).or_insert_with(init))
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_series(&self.counters, MetricKey::new(name, labels), Counter::new, |c| {
            c.increment(n)
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0, Counter::get)
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(&self.gauges, MetricKey::new(name, labels), Gauge::new, |g| {
            g.set(value)
        });
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        with_series(&self.gauges, MetricKey::new(name, labels), Gauge::new, |g| {
            g.add(delta)
        });
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0.0, Gauge::get)
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(
            &self.histograms,
            MetricKey::new(name, labels),
            Histogram::new,
            |h| h.observe(value),
        );
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read()
            .get(&MetricKey::new(name, labels))
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Every series currently recorded, ordered by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut rows: Vec<(MetricKey, MetricSample)> = Vec::new();
        for (key, c) in self.counters.read().iter() {
            rows.push((
                key.clone(),
                key.sample(MetricType::Counter, MetricValue::Counter(c.get())),
            ));
        }
        for (key, g) in self.gauges.read().iter() {
            rows.push((
                key.clone(),
                key.sample(MetricType::Gauge, MetricValue::Gauge(g.get())),
            ));
        }
        for (key, h) in self.histograms.read().iter() {
            rows.push((
                key.clone(),
                key.sample(MetricType::Histogram, MetricValue::Histogram(h.summary())),
            ));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, sample)| sample).collect()
    }
}
