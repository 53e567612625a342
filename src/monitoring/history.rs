//! Metrics History
//!
//! Bounded ring of poll samples, bucketed per hour or per day for
//! `/api/metrics/history`.

use crate::cache::metrics::CacheStats;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Default sample capacity: one week of one-minute polls
pub const DEFAULT_SAMPLE_CAPACITY: usize = 7 * 24 * 60;

// =============================================================================
// Poll Deltas
// =============================================================================

/// Counter movement between two consecutive stats snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsDelta {
    pub requests: u64,
    pub hits: u64,
    pub sets: u64,
    pub errors: u64,
    /// Average get/set latency over the delta (lifetime when nothing moved)
    pub avg_latency_ms: f64,
}

impl StatsDelta {
    /// Delta from `previous` to `current`; with no previous snapshot the
    /// lifetime counters are used.
    pub fn between(previous: Option<&CacheStats>, current: &CacheStats) -> Self {
        let Some(prev) = previous else {
            return Self {
                requests: current.total_requests,
                hits: current.hits,
                sets: current.sets,
                errors: current.errors,
                avg_latency_ms: current.avg_latency_ms(),
            };
        };

        let ops = (current.get_count + current.set_count)
            .saturating_sub(prev.get_count + prev.set_count);
        let latency_us = (current.get_latency_us_total + current.set_latency_us_total)
            .saturating_sub(prev.get_latency_us_total + prev.set_latency_us_total);

        Self {
            requests: current.total_requests.saturating_sub(prev.total_requests),
            hits: current.hits.saturating_sub(prev.hits),
            sets: current.sets.saturating_sub(prev.sets),
            errors: current.errors.saturating_sub(prev.errors),
            avg_latency_ms: if ops == 0 {
                current.avg_latency_ms()
            } else {
                latency_us as f64 / ops as f64 / 1000.0
            },
        }
    }

    /// Errors per operation over the delta
    pub fn error_rate(&self) -> f64 {
        let ops = self.requests + self.sets + self.errors;
        if ops == 0 {
            0.0
        } else {
            self.errors as f64 / ops as f64
        }
    }
}

// =============================================================================
// Samples & Buckets
// =============================================================================

/// One successful poll
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub hit_ratio: f64,
    pub l1_usage_ratio: f64,
    pub avg_latency_ms: f64,
    pub requests: u64,
    pub errors: u64,
}

impl MetricsSample {
    pub fn from_stats(stats: &CacheStats, delta: &StatsDelta) -> Self {
        Self {
            timestamp: stats.timestamp,
            hit_ratio: stats.hit_ratio,
            l1_usage_ratio: stats.l1_memory_usage_ratio(),
            avg_latency_ms: delta.avg_latency_ms,
            requests: delta.requests,
            errors: delta.errors,
        }
    }
}

/// Aggregation period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryPeriod {
    Hourly,
    Daily,
}

impl HistoryPeriod {
    fn span(&self) -> ChronoDuration {
        match self {
            HistoryPeriod::Hourly => ChronoDuration::hours(1),
            HistoryPeriod::Daily => ChronoDuration::days(1),
        }
    }

    /// Start of the period containing `ts`
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.duration_trunc(self.span()).unwrap_or(ts)
    }
}

impl fmt::Display for HistoryPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryPeriod::Hourly => write!(f, "hourly"),
            HistoryPeriod::Daily => write!(f, "daily"),
        }
    }
}

impl FromStr for HistoryPeriod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hourly" | "hour" => Ok(HistoryPeriod::Hourly),
            "daily" | "day" => Ok(HistoryPeriod::Daily),
            other => Err(Error::validation(format!(
                "unknown history period '{}', expected hourly or daily",
                other
            ))),
        }
    }
}

/// Aggregate of the samples inside one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBucket {
    pub period_start: DateTime<Utc>,
    pub samples: usize,
    pub avg_hit_ratio: f64,
    pub peak_l1_usage: f64,
    pub avg_latency_ms: f64,
    pub requests: u64,
    pub errors: u64,
}

impl HistoryBucket {
    fn open(period_start: DateTime<Utc>) -> Self {
        Self {
            period_start,
            samples: 0,
            avg_hit_ratio: 0.0,
            peak_l1_usage: 0.0,
            avg_latency_ms: 0.0,
            requests: 0,
            errors: 0,
        }
    }

    fn add(&mut self, sample: &MetricsSample) {
        let n = self.samples as f64;
        self.avg_hit_ratio = (self.avg_hit_ratio * n + sample.hit_ratio) / (n + 1.0);
        self.avg_latency_ms = (self.avg_latency_ms * n + sample.avg_latency_ms) / (n + 1.0);
        self.peak_l1_usage = self.peak_l1_usage.max(sample.l1_usage_ratio);
        self.requests += sample.requests;
        self.errors += sample.errors;
        self.samples += 1;
    }
}

// =============================================================================
// History Ring
// =============================================================================

/// Bounded sample history
#[derive(Debug)]
pub struct MetricsHistory {
    samples: VecDeque<MetricsSample>,
    capacity: usize,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SAMPLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, dropping the oldest beyond capacity
    pub fn record(&mut self, sample: MetricsSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Samples bucketed by period, oldest bucket first
    pub fn buckets(&self, period: HistoryPeriod) -> Vec<HistoryBucket> {
        let mut buckets: Vec<HistoryBucket> = Vec::new();
        for sample in &self.samples {
            let start = period.bucket_start(sample.timestamp);
            match buckets.last_mut() {
                Some(bucket) if bucket.period_start == start => bucket.add(sample),
                _ => {
                    let mut bucket = HistoryBucket::open(start);
                    bucket.add(sample);
                    buckets.push(bucket);
                }
            }
        }
        buckets
    }

    pub fn latest(&self) -> Option<&MetricsSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for MetricsHistory {
    fn default() -> Self {
        Self::new()
    }
}
