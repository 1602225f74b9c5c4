//! Operator metrics.
//!
//! Each conversion instance owns one [`ConversionMetrics`]; counters only ever
//! grow. A [`MetricsRegistry`] collects instances so a reporting sink can read
//! them while tasks run.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub const ROWS_OUTPUT: &str = "rows_output";
pub const BATCHES_INPUT: &str = "batches_input";
pub const CONVERSION_TIME_NS: &str = "conversion_time_ns";

/// A named add-only counter.
#[derive(Debug)]
pub struct Metric {
    name: &'static str,
    value: AtomicU64,
}

impl Metric {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ConversionMetrics {
    pub rows_output: Metric,
    pub batches_input: Metric,
    pub conversion_time_ns: Metric,
}

impl ConversionMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows_output: Metric::new(ROWS_OUTPUT),
            batches_input: Metric::new(BATCHES_INPUT),
            conversion_time_ns: Metric::new(CONVERSION_TIME_NS),
        })
    }

    /// Run `f`, adding its wall time to `conversion_time_ns`.
    pub fn time<T>(&self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.conversion_time_ns
            .add(start.elapsed().as_nanos().min(u64::MAX as u128) as u64);
        out
    }

    /// Account for one accepted batch of `rows` rows.
    pub fn record_batch(&self, rows: usize) {
        self.batches_input.add(1);
        self.rows_output.add(rows as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rows_output: self.rows_output.value(),
            batches_input: self.batches_input.value(),
            conversion_time_ns: self.conversion_time_ns.value(),
        }
    }
}

/// Point-in-time copy of a [`ConversionMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rows_output: u64,
    pub batches_input: u64,
    pub conversion_time_ns: u64,
}

impl MetricsSnapshot {
    /// Same counts, ignoring time.
    pub fn same_counts(&self, other: &Self) -> bool {
        self.rows_output == other.rows_output && self.batches_input == other.batches_input
    }
}

impl std::ops::Add for MetricsSnapshot {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            rows_output: self.rows_output + rhs.rows_output,
            batches_input: self.batches_input + rhs.batches_input,
            conversion_time_ns: self.conversion_time_ns + rhs.conversion_time_ns,
        }
    }
}

/// Operator instances by id.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    operators: DashMap<String, Arc<ConversionMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `metrics` under `id`, replacing any previous entry.
    pub fn register(&self, id: impl Into<String>, metrics: Arc<ConversionMetrics>) {
        self.operators.insert(id.into(), metrics);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConversionMetrics>> {
        self.operators.get(id).map(|m| Arc::clone(m.value()))
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Snapshots of every instance, sorted by id.
    pub fn report(&self) -> Vec<(String, MetricsSnapshot)> {
        let mut out: Vec<_> = self
            .operators
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn total(&self) -> MetricsSnapshot {
        self.operators
            .iter()
            .map(|e| e.value().snapshot())
            .fold(MetricsSnapshot::default(), |acc, s| acc + s)
    }
}
