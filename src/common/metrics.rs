//! Cache metrics collection
//!
//! Lock-free counters, gauges and latency histograms, rendered in the
//! Prometheus text format:
//! - Operation latency histograms (get, put, remove, invoke, commit)
//! - Near-cache hit/miss/invalidation counters
//! - Replication apply/drop/failure counters
//! - Transaction outcome counters

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, Prometheus style
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturating so a late decrement never wraps
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-operation metrics
#[derive(Debug, Default)]
pub struct OperationMetrics {
    pub total: Counter,
    pub errors: Counter,
    pub latency: Histogram,
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    operations: Mutex<HashMap<&'static str, Arc<OperationMetrics>>>,

    pub near_hits: Counter,
    pub near_misses: Counter,
    pub near_invalidations: Counter,
    pub stale_reads: Counter,

    pub replication_applied: Counter,
    pub replication_dropped: Counter,
    pub replication_failures: Counter,

    pub tx_committed: Counter,
    pub tx_rolled_back: Counter,
    pub lock_waits: Counter,

    pub active_transactions: Gauge,
    pub live_nodes: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            near_hits: Counter::new(),
            near_misses: Counter::new(),
            near_invalidations: Counter::new(),
            stale_reads: Counter::new(),
            replication_applied: Counter::new(),
            replication_dropped: Counter::new(),
            replication_failures: Counter::new(),
            tx_committed: Counter::new(),
            tx_rolled_back: Counter::new(),
            lock_waits: Counter::new(),
            active_transactions: Gauge::new(),
            live_nodes: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for an operation
    pub fn operation(&self, name: &'static str) -> Arc<OperationMetrics> {
        let mut ops = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        ops.entry(name)
            .or_insert_with(|| Arc::new(OperationMetrics::default()))
            .clone()
    }

    /// Record a completed cache operation
    pub fn record_operation(&self, name: &'static str, duration: Duration, success: bool) {
        let op = self.operation(name);
        op.total.inc();
        op.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            op.errors.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 10] = [
            ("partcache_near_hits_total", "Near-cache hits", &self.near_hits),
            ("partcache_near_misses_total", "Near-cache misses", &self.near_misses),
            (
                "partcache_near_invalidations_total",
                "Near-cache invalidations received",
                &self.near_invalidations,
            ),
            ("partcache_stale_reads_total", "Near-cache entries proven stale", &self.stale_reads),
            (
                "partcache_replication_applied_total",
                "Replica updates applied by backups",
                &self.replication_applied,
            ),
            (
                "partcache_replication_dropped_total",
                "Stale or duplicate replica updates dropped",
                &self.replication_dropped,
            ),
            (
                "partcache_replication_failures_total",
                "Replica updates that never reached a backup",
                &self.replication_failures,
            ),
            ("partcache_tx_committed_total", "Committed transactions", &self.tx_committed),
            ("partcache_tx_rolled_back_total", "Rolled back transactions", &self.tx_rolled_back),
            ("partcache_lock_waits_total", "Lock acquisitions that had to wait", &self.lock_waits),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, u64); 3] = [
            (
                "partcache_active_transactions",
                "Transactions not yet committed or rolled back",
                self.active_transactions.get(),
            ),
            ("partcache_live_nodes", "Live grid nodes", self.live_nodes.get()),
            ("partcache_uptime_seconds", "Process uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        let ops = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&&str> = ops.keys().collect();
        names.sort();

        out.push_str("# HELP partcache_operations_total Cache operations by kind\n");
        out.push_str("# TYPE partcache_operations_total counter\n");
        for name in &names {
            let _ = writeln!(
                out,
                "partcache_operations_total{{op=\"{}\"}} {}",
                name, ops[**name].total.get()
            );
        }

        out.push_str("# HELP partcache_operation_errors_total Failed cache operations by kind\n");
        out.push_str("# TYPE partcache_operation_errors_total counter\n");
        for name in &names {
            let _ = writeln!(
                out,
                "partcache_operation_errors_total{{op=\"{}\"}} {}",
                name, ops[**name].errors.get()
            );
        }

        out.push_str("# HELP partcache_operation_duration_ms Operation duration in milliseconds\n");
        out.push_str("# TYPE partcache_operation_duration_ms histogram\n");
        for name in &names {
            let metrics = &ops[**name];
            for (le, count) in metrics.latency.get_buckets() {
                if le.is_infinite() {
                    let _ = writeln!(
                        out,
                        "partcache_operation_duration_ms_bucket{{op=\"{}\",le=\"+Inf\"}} {}",
                        name, count
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "partcache_operation_duration_ms_bucket{{op=\"{}\",le=\"{}\"}} {}",
                        name, le, count
                    );
                }
            }
            let _ = writeln!(
                out,
                "partcache_operation_duration_ms_sum{{op=\"{}\"}} {}",
                name,
                metrics.latency.sum()
            );
            let _ = writeln!(
                out,
                "partcache_operation_duration_ms_count{{op=\"{}\"}} {}",
                name,
                metrics.latency.count()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(0.3);
        hist.observe(50.0);
        hist.observe(5000.0);

        assert_eq!(hist.count(), 3);

        let buckets = hist.get_buckets();
        assert_eq!(buckets.last().unwrap().1, 3);
        assert_eq!(buckets[0].1, 0);
        assert_eq!(buckets[1].1, 1);
    }

    #[test]
    fn test_counter() {
        let counter = Counter::new();

        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_never_wraps() {
        let gauge = Gauge::new();

        gauge.set(1);
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_registry_records_operations() {
        let registry = MetricsRegistry::new();

        registry.record_operation("get", Duration::from_millis(2), true);
        registry.record_operation("get", Duration::from_millis(3), false);
        registry.near_hits.inc();

        let get = registry.operation("get");
        assert_eq!(get.total.get(), 2);
        assert_eq!(get.errors.get(), 1);

        let text = registry.to_prometheus();
        assert!(text.contains("partcache_operations_total{op=\"get\"} 2"));
        assert!(text.contains("partcache_near_hits_total 1"));
    }
}
