//! Run metrics collection
//!
//! Virtual users record every operation into a shared [`MetricsRecorder`];
//! the orchestrator drains it on each snapshot tick. Cumulative totals are
//! reset when RUNNING begins so warmup traffic never leaks into the
//! measurement window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use querybench_common::{LatencyStats, PerfSample};

/// Cap on retained measurement-window latency samples
const MAX_RETAINED_SAMPLES: usize = 200_000;

/// Metrics drained from one snapshot interval
#[derive(Debug, Clone)]
pub struct IntervalMetrics {
    pub ops_per_sec: f64,
    pub latency: LatencyStats,
    pub ops: u64,
    pub errors: u64,
    pub error_rate: f64,
}

impl IntervalMetrics {
    pub fn perf_sample(&self) -> PerfSample {
        PerfSample {
            ops_per_sec: self.ops_per_sec,
            p95_latency_ms: self.latency.p95,
            error_rate: self.error_rate,
        }
    }
}

/// Shared, lock-light recorder for operation outcomes
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    total_ops: AtomicU64,
    total_errors: AtomicU64,
    interval_ops: AtomicU64,
    interval_errors: AtomicU64,
    interval_latencies: Mutex<Vec<f64>>,
    window_latencies: Mutex<Vec<f64>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed operation
    pub fn record(&self, latency_ms: f64, ok: bool) {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        self.interval_ops.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
            self.interval_errors.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut samples) = self.interval_latencies.lock() {
            samples.push(latency_ms);
        }
        if let Ok(mut window) = self.window_latencies.lock() {
            if window.len() < MAX_RETAINED_SAMPLES {
                window.push(latency_ms);
            }
        }
    }

    /// Drain the interval counters, producing one snapshot's metrics
    pub fn drain_interval(&self, elapsed: Duration) -> IntervalMetrics {
        let ops = self.interval_ops.swap(0, Ordering::Relaxed);
        let errors = self.interval_errors.swap(0, Ordering::Relaxed);
        let samples = self
            .interval_latencies
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default();

        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        IntervalMetrics {
            ops_per_sec: ops as f64 / secs,
            latency: LatencyStats::from_millis(&samples),
            ops,
            errors,
            error_rate: if ops > 0 {
                errors as f64 / ops as f64
            } else {
                0.0
            },
        }
    }

    /// Reset everything at the start of the measurement window
    pub fn reset(&self) {
        self.total_ops.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
        self.interval_ops.store(0, Ordering::Relaxed);
        self.interval_errors.store(0, Ordering::Relaxed);
        if let Ok(mut s) = self.interval_latencies.lock() {
            s.clear();
        }
        if let Ok(mut s) = self.window_latencies.lock() {
            s.clear();
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_ops.load(Ordering::Relaxed),
            self.total_errors.load(Ordering::Relaxed),
        )
    }

    /// Latency summary over the whole measurement window
    pub fn window_stats(&self) -> LatencyStats {
        let samples = self
            .window_latencies
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        LatencyStats::from_millis(&samples)
    }
}

/// Host memory utilization source for the guardrail monitor
pub trait MemoryProbe: Send + Sync {
    /// Used memory as a percentage of total, None when unavailable
    fn used_pct(&self) -> Option<f64>;
}

/// Reads /proc/meminfo; returns None on other platforms
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn used_pct(&self) -> Option<f64> {
        let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
        let field = |name: &str| -> Option<f64> {
            raw.lines()
                .find(|l| l.starts_with(name))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()
        };
        let total = field("MemTotal:")?;
        let available = field("MemAvailable:")?;
        if total <= 0.0 {
            return None;
        }
        Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
    }
}

/// Fixed reading, settable at runtime. Used by tests and embedders that
/// measure memory on the target side.
#[derive(Default)]
pub struct StaticMemoryProbe {
    millipct: AtomicU64,
}

impl StaticMemoryProbe {
    pub fn new(pct: f64) -> Self {
        let probe = Self::default();
        probe.set(pct);
        probe
    }

    pub fn set(&self, pct: f64) {
        self.millipct
            .store((pct.clamp(0.0, 100.0) * 1000.0) as u64, Ordering::SeqCst);
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn used_pct(&self) -> Option<f64> {
        Some(self.millipct.load(Ordering::SeqCst) as f64 / 1000.0)
    }
}
