//! Performance/Audit Logger, in-memory half (C14).
//!
//! Audit records are persisted via [`crate::store::DocumentStore::record_audit`];
//! this module holds the other stream: named counters and timers kept in a
//! bounded ring buffer per name, with p50/p95/p99 summaries computed on
//! request. Recording a timer past `slow_query_ms` or `critical_op_ms` emits
//! an elevated log line but never changes control flow.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::config::PerformanceConfig;

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: i64,
    value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

struct Series {
    samples: Vec<Sample>,
    capacity: usize,
}

impl Series {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, timestamp: i64, value: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.remove(0);
        }
        self.samples.push(Sample { timestamp, value });
    }

    fn summary(&self) -> Summary {
        if self.samples.is_empty() {
            return Summary::default();
        }
        let mut values: Vec<f64> = self.samples.iter().map(|s| s.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());

        Summary {
            count: values.len(),
            p50: percentile(&values, 0.50),
            p95: percentile(&values, 0.95),
            p99: percentile(&values, 0.99),
            min: values[0],
            max: values[values.len() - 1],
        }
    }
}

fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[rank.min(sorted_values.len() - 1)]
}

/// Process-local metrics registry. Counters and timers share storage keyed
/// by name; tags are recorded for log context only, not indexed.
pub struct Metrics {
    enabled: bool,
    slow_query_ms: u64,
    critical_op_ms: u64,
    capacity: usize,
    series: Mutex<HashMap<String, Series>>,
}

impl Metrics {
    pub fn new(config: &PerformanceConfig) -> Self {
        Self {
            enabled: config.enable_metrics,
            slow_query_ms: config.slow_query_ms,
            critical_op_ms: config.critical_op_ms,
            capacity: config.max_datapoints.max(1),
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn increment(&self, name: &str) {
        self.record(name, 1.0, &[]);
    }

    pub fn record(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        if !self.enabled {
            return;
        }
        let now = chrono::Utc::now().timestamp();
        let mut series = self.series.lock().expect("metrics mutex poisoned");
        series
            .entry(name.to_string())
            .or_insert_with(|| Series::new(self.capacity))
            .push(now, value);

        if !tags.is_empty() {
            info!(target: "kenny::metrics", metric = name, value, ?tags, "recorded metric");
        }
    }

    /// Record a duration in milliseconds, logging an elevated line if it
    /// crosses the configured slow/critical thresholds.
    pub fn record_duration_ms(&self, name: &str, duration_ms: u64) {
        self.record(name, duration_ms as f64, &[]);

        if !self.enabled {
            return;
        }
        if duration_ms >= self.critical_op_ms {
            warn!(target: "kenny::metrics", metric = name, duration_ms, "critical operation duration exceeded");
        } else if duration_ms >= self.slow_query_ms {
            warn!(target: "kenny::metrics", metric = name, duration_ms, "slow operation duration exceeded");
        }
    }

    pub fn summary(&self, name: &str) -> Summary {
        self.series
            .lock()
            .expect("metrics mutex poisoned")
            .get(name)
            .map(|s| s.summary())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.series
            .lock()
            .expect("metrics mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> PerformanceConfig {
        PerformanceConfig {
            enable_metrics: true,
            retention_days: 30,
            slow_query_ms: 500,
            critical_op_ms: 2000,
            enable_tracing: false,
            memory_warning_mb: 256,
            max_datapoints: capacity,
        }
    }

    #[test]
    fn summary_is_empty_for_unknown_metric() {
        let metrics = Metrics::new(&config(100));
        let summary = metrics.summary("unused");
        assert_eq!(summary.count, 0);
    }

    #[test]
    fn computes_percentiles_over_recorded_values() {
        let metrics = Metrics::new(&config(100));
        for v in 1..=100 {
            metrics.record("latency_ms", v as f64, &[]);
        }
        let summary = metrics.summary("latency_ms");
        assert_eq!(summary.count, 100);
        assert!((summary.p50 - 50.0).abs() <= 2.0);
        assert!(summary.p99 >= 98.0);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let metrics = Metrics::new(&config(3));
        metrics.record("x", 1.0, &[]);
        metrics.record("x", 2.0, &[]);
        metrics.record("x", 3.0, &[]);
        metrics.record("x", 4.0, &[]);
        let summary = metrics.summary("x");
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min, 2.0);
        assert_eq!(summary.max, 4.0);
    }

    #[test]
    fn disabled_metrics_record_nothing() {
        let mut cfg = config(100);
        cfg.enable_metrics = false;
        let metrics = Metrics::new(&cfg);
        metrics.record("x", 1.0, &[]);
        assert_eq!(metrics.summary("x").count, 0);
    }

    #[test]
    fn increment_accumulates_count() {
        let metrics = Metrics::new(&config(100));
        metrics.increment("calls");
        metrics.increment("calls");
        metrics.increment("calls");
        assert_eq!(metrics.summary("calls").count, 3);
    }
}
