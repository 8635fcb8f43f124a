//! In-process metrics for tasks and storage writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Point-in-time value, published by its owner with `set`.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Upper bounds (ms) of the latency buckets. Storage writes can sit in
/// backend-local retries for several seconds, hence the long tail.
const LATENCY_BOUNDS_MS: [u64; 12] = [
    5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000,
];

/// Latency histogram in milliseconds.
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BOUNDS_MS.len()],
    sum: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observation. Values past the last bound land in the last bucket.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(ms, Ordering::Relaxed);

        let index = LATENCY_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len() - 1);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            count => self.sum.load(Ordering::Relaxed) as f64 / count as f64,
        }
    }

    /// `(upper bound, count)` per bucket.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        LATENCY_BOUNDS_MS
            .iter()
            .zip(&self.buckets)
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the enrichment pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    // Task metrics
    pub jobs_submitted: Counter,
    pub jobs_succeeded: Counter,
    pub jobs_failed: Counter,
    pub job_retries: Counter,
    pub jobs_redelivered: Counter,
    pub enrichment_errors: Counter,

    // Storage metrics
    pub records_persisted: Counter,
    pub storage_write_errors: Counter,
    pub bulk_index_item_failures: Counter,
    pub backend_init_failures: Counter,

    // Latency histograms
    pub enrichment_latency_ms: Histogram,
    pub storage_latency_ms: Histogram,
    pub batch_write_latency_ms: Histogram,

    // Gauges
    pub queue_depth: Gauge,
    pub in_flight_jobs: Gauge,
    pub active_backends: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub jobs_submitted: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub job_retries: u64,
    pub jobs_redelivered: u64,
    pub enrichment_errors: u64,
    pub records_persisted: u64,
    pub storage_write_errors: u64,
    pub bulk_index_item_failures: u64,
    pub backend_init_failures: u64,
    pub enrichment_latency_mean_ms: f64,
    pub storage_latency_mean_ms: f64,
    pub storage_latency_max_ms: u64,
    pub batch_write_latency_mean_ms: f64,
    pub queue_depth: u64,
    pub in_flight_jobs: u64,
    pub active_backends: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            jobs_submitted: self.jobs_submitted.get(),
            jobs_succeeded: self.jobs_succeeded.get(),
            jobs_failed: self.jobs_failed.get(),
            job_retries: self.job_retries.get(),
            jobs_redelivered: self.jobs_redelivered.get(),
            enrichment_errors: self.enrichment_errors.get(),
            records_persisted: self.records_persisted.get(),
            storage_write_errors: self.storage_write_errors.get(),
            bulk_index_item_failures: self.bulk_index_item_failures.get(),
            backend_init_failures: self.backend_init_failures.get(),
            enrichment_latency_mean_ms: self.enrichment_latency_ms.mean(),
            storage_latency_mean_ms: self.storage_latency_ms.mean(),
            storage_latency_max_ms: self.storage_latency_ms.max(),
            batch_write_latency_mean_ms: self.batch_write_latency_ms.mean(),
            queue_depth: self.queue_depth.get(),
            in_flight_jobs: self.in_flight_jobs.get(),
            active_backends: self.active_backends.get(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
