use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

const BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

/// Destination for the counters, gauges and histograms emitted by a component.
///
/// Components take a sink at construction instead of writing to the process-wide
/// recorder directly, so tests can observe what a single component emitted and
/// services can decide where metrics go. `NoopMetrics` is the default.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, labels: &[(String, String)], value: u64);
    fn gauge(&self, name: &'static str, labels: &[(String, String)], value: f64);
    fn histogram(&self, name: &'static str, labels: &[(String, String)], value: f64);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _labels: &[(String, String)], _value: u64) {}
    fn gauge(&self, _name: &'static str, _labels: &[(String, String)], _value: f64) {}
    fn histogram(&self, _name: &'static str, _labels: &[(String, String)], _value: f64) {}
}

/// Forwards to the global `metrics` recorder, e.g. the one installed by `serve_prometheus`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl MetricsSink for RecorderMetrics {
    fn increment(&self, name: &'static str, labels: &[(String, String)], value: u64) {
        metrics::counter!(name, labels).increment(value);
    }

    fn gauge(&self, name: &'static str, labels: &[(String, String)], value: f64) {
        metrics::gauge!(name, labels).set(value);
    }

    fn histogram(&self, name: &'static str, labels: &[(String, String)], value: f64) {
        metrics::histogram!(name, labels).record(value);
    }
}

pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// Install the prometheus recorder together with its own scrape listener on `bind`.
/// Must be called from within a tokio runtime.
pub fn serve_prometheus(bind: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .with_http_listener(bind)
        .install()?;
    tracing::info!(%bind, "prometheus exporter listening");
    Ok(())
}

// Keyed by name plus sorted labels, e.g. `consumer_messages_total{status=ok}`
fn series_key(name: &str, labels: &[(String, String)]) -> String {
    let mut labels = labels.to_vec();
    labels.sort();
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

/// Keeps every series in memory. Meant for tests.
#[derive(Debug, Default)]
pub struct CapturingMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl CapturingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = series_key(name, &owned(labels));
        self.counters
            .lock()
            .map(|c| c.get(&key).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{name}{{");
        self.counters
            .lock()
            .map(|c| {
                c.iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(_, v)| *v)
                    .sum()
            })
            .unwrap_or_default()
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = series_key(name, &owned(labels));
        self.gauges.lock().ok().and_then(|g| g.get(&key).copied())
    }

    pub fn histogram_values(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        let key = series_key(name, &owned(labels));
        self.histograms
            .lock()
            .ok()
            .and_then(|h| h.get(&key).cloned())
            .unwrap_or_default()
    }
}

fn owned(labels: &[(&str, &str)]) -> Vec<(String, String)> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl MetricsSink for CapturingMetrics {
    fn increment(&self, name: &'static str, labels: &[(String, String)], value: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(series_key(name, labels)).or_default() += value;
        }
    }

    fn gauge(&self, name: &'static str, labels: &[(String, String)], value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(series_key(name, labels), value);
        }
    }

    fn histogram(&self, name: &'static str, labels: &[(String, String)], value: f64) {
        if let Ok(mut histograms) = self.histograms.lock() {
            histograms
                .entry(series_key(name, labels))
                .or_default()
                .push(value);
        }
    }
}

// A guard to record the time between creation and drop as a histogram entry, in milliseconds
pub struct TimingGuard<'a> {
    sink: &'a dyn MetricsSink,
    name: &'static str,
    labels: Vec<(String, String)>,
    start: Instant,
}

// Shorthand constructor for that guard
pub fn timing_guard<'a>(
    sink: &'a dyn MetricsSink,
    name: &'static str,
    labels: &[(String, String)],
) -> TimingGuard<'a> {
    TimingGuard {
        sink,
        name,
        labels: labels.to_vec(),
        start: Instant::now(),
    }
}

impl TimingGuard<'_> {
    // Consumes the guard, so "label this and report immediately" is a one-liner.
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }
}

impl Drop for TimingGuard<'_> {
    fn drop(&mut self) {
        self.sink.histogram(
            self.name,
            &self.labels,
            self.start.elapsed().as_millis() as f64,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        owned(pairs)
    }

    #[test]
    fn test_capturing_counters_are_keyed_by_labels() {
        let sink = CapturingMetrics::new();
        sink.increment("msgs", &labels(&[("status", "ok")]), 2);
        sink.increment("msgs", &labels(&[("status", "ok")]), 1);
        sink.increment("msgs", &labels(&[("status", "error")]), 5);

        assert_eq!(sink.counter("msgs", &[("status", "ok")]), 3);
        assert_eq!(sink.counter("msgs", &[("status", "error")]), 5);
        assert_eq!(sink.counter("msgs", &[("status", "other")]), 0);
        assert_eq!(sink.counter_total("msgs"), 8);
    }

    #[test]
    fn test_label_order_does_not_matter() {
        let sink = CapturingMetrics::new();
        sink.gauge("offset", &labels(&[("topic", "t"), ("partition", "1")]), 42.0);

        assert_eq!(
            sink.gauge_value("offset", &[("partition", "1"), ("topic", "t")]),
            Some(42.0)
        );
    }

    #[test]
    fn test_timing_guard_records_on_drop() {
        let sink = CapturingMetrics::new();
        {
            let _guard = timing_guard(&sink, "flush_ms", &[]).label("outcome", "success");
        }
        let recorded = sink.histogram_values("flush_ms", &[("outcome", "success")]);
        assert_eq!(recorded.len(), 1);
    }

    #[test]
    fn test_noop_accepts_everything() {
        let sink = noop();
        sink.increment("a", &[], 1);
        sink.gauge("b", &[], 1.0);
        sink.histogram("c", &[], 1.0);
    }
}
