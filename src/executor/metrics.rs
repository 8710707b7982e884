//! Per-capability execution metrics.
//!
//! Only raw counters are stored; averages and rates are derived when a
//! snapshot is taken.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default)]
struct MetricsRecord {
    calls: u64,
    successes: u64,
    failures: u64,
    total_latency: Duration,
    last_error: Option<String>,
    last_success_time: Option<DateTime<Utc>>,
    cache_hits: u64,
    cache_misses: u64,
}

/// Counters for one capability plus derived rates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub name: String,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub last_error: Option<String>,
    pub last_success_time: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    fn derive(name: &str, record: &MetricsRecord) -> Self {
        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let total_ms = record.total_latency.as_secs_f64() * 1000.0;
        Self {
            name: name.to_string(),
            calls: record.calls,
            successes: record.successes,
            failures: record.failures,
            total_latency_ms: record.total_latency.as_millis() as u64,
            avg_latency_ms: if record.calls == 0 {
                0.0
            } else {
                total_ms / record.calls as f64
            },
            success_rate: ratio(record.successes, record.calls),
            cache_hits: record.cache_hits,
            cache_misses: record.cache_misses,
            cache_hit_rate: ratio(record.cache_hits, record.cache_hits + record.cache_misses),
            last_error: record.last_error.clone(),
            last_success_time: record.last_success_time,
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricsStore {
    records: DashMap<String, MetricsRecord>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, name: &str, latency: Duration) {
        let mut record = self.records.entry(name.to_string()).or_default();
        record.calls += 1;
        record.successes += 1;
        record.total_latency += latency;
        record.last_success_time = Some(Utc::now());
    }

    pub fn record_failure(&self, name: &str, latency: Duration, error: &str) {
        let mut record = self.records.entry(name.to_string()).or_default();
        record.calls += 1;
        record.failures += 1;
        record.total_latency += latency;
        record.last_error = Some(error.to_string());
    }

    pub fn record_cache_hit(&self, name: &str) {
        self.records.entry(name.to_string()).or_default().cache_hits += 1;
    }

    pub fn record_cache_miss(&self, name: &str) {
        self.records.entry(name.to_string()).or_default().cache_misses += 1;
    }

    pub fn snapshot(&self, name: &str) -> Option<MetricsSnapshot> {
        self.records
            .get(name)
            .map(|record| MetricsSnapshot::derive(name, &record))
    }

    /// Snapshots for every capability, sorted by name.
    pub fn all(&self) -> Vec<MetricsSnapshot> {
        let mut out: Vec<MetricsSnapshot> = self
            .records
            .iter()
            .map(|entry| MetricsSnapshot::derive(entry.key(), entry.value()))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Reset one capability's counters, or all of them.
    pub fn reset(&self, name: Option<&str>) {
        match name {
            Some(name) => {
                self.records.remove(name);
            }
            None => self.records.clear(),
        }
    }
}
