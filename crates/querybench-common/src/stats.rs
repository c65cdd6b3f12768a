//! Latency statistics utilities
//!
//! Provides `LatencyStats` for percentile summaries of latency samples and
//! `SampleWindow`, the bounded rolling window of per-interval performance
//! samples that scaling strategies consume.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Percentile summary of a batch of latency measurements (milliseconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub max: f64,
    /// Number of valid measurements
    pub count: usize,
}

impl LatencyStats {
    /// Compute statistics from latency samples in milliseconds.
    ///
    /// Filters out non-finite values (NaN, infinity) before computing.
    /// Percentiles use the nearest-rank method on the sorted samples.
    pub fn from_millis(samples: &[f64]) -> Self {
        let mut valid: Vec<f64> = samples.iter().copied().filter(|x| x.is_finite()).collect();
        if valid.is_empty() {
            return Self::default();
        }
        valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = valid.len();
        let sum: f64 = valid.iter().sum();
        let pick = |q: f64| -> f64 {
            let rank = ((q * count as f64).ceil() as usize).clamp(1, count);
            valid[rank - 1]
        };

        Self {
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
            mean: sum / count as f64,
            max: valid[count - 1],
            count,
        }
    }

    /// Check if no valid samples were provided
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// One interval's worth of observed performance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerfSample {
    pub ops_per_sec: f64,
    pub p95_latency_ms: f64,
    /// Errors / total for the interval, 0.0 when no operations ran
    pub error_rate: f64,
}

/// Bounded rolling window of recent performance samples
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<PerfSample>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: PerfSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&PerfSample> {
        self.samples.back()
    }

    /// Mean throughput across the window, 0.0 when empty
    pub fn mean_ops_per_sec(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.ops_per_sec).sum::<f64>() / self.samples.len() as f64
    }

    /// Worst p95 latency across the window, 0.0 when empty
    pub fn max_p95_latency_ms(&self) -> f64 {
        self.samples
            .iter()
            .map(|s| s.p95_latency_ms)
            .fold(0.0, f64::max)
    }

    /// Mean error rate across the window, 0.0 when empty
    pub fn mean_error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.error_rate).sum::<f64>() / self.samples.len() as f64
    }
}
