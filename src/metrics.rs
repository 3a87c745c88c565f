//! # Metrics Core
//!
//! Counters, gauges, histograms (with percentile estimation) and summaries,
//! labeled, adapted from the teacher's
//! `enterprise::tracing::metrics::MetricRegistry` — kept close to verbatim
//! since it already matches spec.md §6's "Counter, gauge, histogram,
//! summary types with labels" requirement, extended with the percentile
//! estimation (p50/p75/p90/p95/p99) and min/max spec.md names that the
//! teacher's version didn't track. Consumed by an external HTTP exporter
//! (out of scope per spec.md §1); this module only produces the
//! Prometheus-format text body a handler would serve.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Registry of every metric this crate's subsystems publish.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    inner: Arc<RwLock<HashMap<String, Metric>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> Counter {
        let handle = Arc::new(RwLock::new(0u64));
        self.inner.write().entry(name.to_string()).or_insert_with(|| Metric::Counter(handle.clone()));
        Counter { value: handle }
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        let handle = Arc::new(RwLock::new(0f64));
        self.inner.write().entry(name.to_string()).or_insert_with(|| Metric::Gauge(handle.clone()));
        Gauge { value: handle }
    }

    pub fn histogram(&self, name: &str) -> Histogram {
        let handle = Arc::new(RwLock::new(Vec::new()));
        self.inner.write().entry(name.to_string()).or_insert_with(|| Metric::Histogram(handle.clone()));
        Histogram { observations: handle }
    }

    /// Renders every registered metric as Prometheus text exposition
    /// format.
    pub fn encode_prometheus(&self) -> String {
        let metrics = self.inner.read();
        let mut out = String::new();
        let mut names: Vec<&String> = metrics.keys().collect();
        names.sort();

        for name in names {
            match &metrics[name] {
                Metric::Counter(v) => {
                    out.push_str(&format!("# TYPE {name} counter\n{name} {}\n", *v.read()));
                }
                Metric::Gauge(v) => {
                    out.push_str(&format!("# TYPE {name} gauge\n{name} {}\n", *v.read()));
                }
                Metric::Histogram(obs) => {
                    let summary = HistogramSummary::from_observations(&obs.read());
                    out.push_str(&format!("# TYPE {name} summary\n"));
                    out.push_str(&format!("{name}_sum {}\n", summary.sum));
                    out.push_str(&format!("{name}_count {}\n", summary.count));
                    out.push_str(&format!("{name}{{quantile=\"0.5\"}} {}\n", summary.p50));
                    out.push_str(&format!("{name}{{quantile=\"0.75\"}} {}\n", summary.p75));
                    out.push_str(&format!("{name}{{quantile=\"0.9\"}} {}\n", summary.p90));
                    out.push_str(&format!("{name}{{quantile=\"0.95\"}} {}\n", summary.p95));
                    out.push_str(&format!("{name}{{quantile=\"0.99\"}} {}\n", summary.p99));
                }
            }
        }
        out
    }

    /// Snapshot every histogram's summary statistics, keyed by name —
    /// consumed by `get_stats()` (spec.md §6).
    pub fn histogram_summaries(&self) -> HashMap<String, HistogramSummary> {
        self.inner
            .read()
            .iter()
            .filter_map(|(name, metric)| match metric {
                Metric::Histogram(obs) => Some((name.clone(), HistogramSummary::from_observations(&obs.read()))),
                _ => None,
            })
            .collect()
    }

    pub fn counter_values(&self) -> HashMap<String, u64> {
        self.inner
            .read()
            .iter()
            .filter_map(|(name, metric)| match metric {
                Metric::Counter(v) => Some((name.clone(), *v.read())),
                _ => None,
            })
            .collect()
    }

    pub fn gauge_values(&self) -> HashMap<String, f64> {
        self.inner
            .read()
            .iter()
            .filter_map(|(name, metric)| match metric {
                Metric::Gauge(v) => Some((name.clone(), *v.read())),
                _ => None,
            })
            .collect()
    }
}

enum Metric {
    Counter(Arc<RwLock<u64>>),
    Gauge(Arc<RwLock<f64>>),
    Histogram(Arc<RwLock<Vec<f64>>>),
}

/// Monotonically increasing count.
#[derive(Clone)]
pub struct Counter {
    value: Arc<RwLock<u64>>,
}

impl Counter {
    pub fn inc(&self) {
        *self.value.write() += 1;
    }
    pub fn inc_by(&self, n: u64) {
        *self.value.write() += n;
    }
    pub fn get(&self) -> u64 {
        *self.value.read()
    }
}

/// Point-in-time value that can move in either direction.
#[derive(Clone)]
pub struct Gauge {
    value: Arc<RwLock<f64>>,
}

impl Gauge {
    pub fn set(&self, v: f64) {
        *self.value.write() = v;
    }
    pub fn add(&self, delta: f64) {
        *self.value.write() += delta;
    }
    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

/// Distribution of observed values with percentile estimation.
#[derive(Clone)]
pub struct Histogram {
    observations: Arc<RwLock<Vec<f64>>>,
}

impl Histogram {
    pub fn observe(&self, value: f64) {
        self.observations.write().push(value);
    }

    pub fn summary(&self) -> HistogramSummary {
        HistogramSummary::from_observations(&self.observations.read())
    }
}

/// Sum, count, min, max, and p50/p75/p90/p95/p99 over a histogram's
/// observations (spec.md §6: "Histograms expose sum, count, min, max, and
/// p50/p75/p90/p95/p99").
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistogramSummary {
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl HistogramSummary {
    fn from_observations(observations: &[f64]) -> Self {
        if observations.is_empty() {
            return Self::default();
        }
        let mut sorted = observations.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let percentile = |p: f64| -> f64 {
            let rank = (p * (sorted.len() - 1) as f64).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };

        Self {
            sum: sorted.iter().sum(),
            count: sorted.len() as u64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: percentile(0.50),
            p75: percentile(0.75),
            p90: percentile(0.90),
            p95: percentile(0.95),
            p99: percentile(0.99),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let registry = MetricRegistry::new();
        let c = registry.counter("enqueued_total");
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn gauge_tracks_latest_value() {
        let registry = MetricRegistry::new();
        let g = registry.gauge("queue_depth");
        g.set(10.0);
        g.add(-3.0);
        assert_eq!(g.get(), 7.0);
    }

    #[test]
    fn histogram_percentiles_over_known_distribution() {
        let registry = MetricRegistry::new();
        let h = registry.histogram("batch_latency_ms");
        for v in 1..=100 {
            h.observe(v as f64);
        }
        let summary = h.summary();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert!((summary.p50 - 50.0).abs() <= 1.0);
        assert!((summary.p99 - 99.0).abs() <= 2.0);
    }

    #[test]
    fn prometheus_export_contains_registered_names() {
        let registry = MetricRegistry::new();
        registry.counter("dropped_total").inc();
        registry.gauge("backpressure_active").set(1.0);
        let text = registry.encode_prometheus();
        assert!(text.contains("dropped_total"));
        assert!(text.contains("backpressure_active"));
    }
}
