//! Cancellation guardrails
//!
//! Evaluated against every metric snapshot. The first breached threshold
//! produces a single cancel request carrying the triggering condition; the
//! monitor is inert afterwards, so repeated breaches during the drain never
//! produce duplicate cancellations.

use querybench_common::GuardrailConfig;
use tracing::warn;

use crate::metrics::IntervalMetrics;

pub struct GuardrailMonitor {
    config: GuardrailConfig,
    fired: bool,
}

impl GuardrailMonitor {
    pub fn new(config: GuardrailConfig) -> Self {
        Self {
            config,
            fired: false,
        }
    }

    /// Returns the cancel reason on the first breach, None otherwise
    pub fn check(&mut self, metrics: &IntervalMetrics, memory_pct: Option<f64>) -> Option<String> {
        if self.fired || !self.config.is_enabled() {
            return None;
        }

        let reason = self.breach_reason(metrics, memory_pct)?;
        self.fired = true;
        warn!(reason = %reason, "guardrail breached, requesting cancellation");
        Some(reason)
    }

    fn breach_reason(
        &self,
        metrics: &IntervalMetrics,
        memory_pct: Option<f64>,
    ) -> Option<String> {
        if let (Some(max), Some(used)) = (self.config.max_memory_pct, memory_pct) {
            if used > max {
                return Some(format!(
                    "memory utilization {used:.1}% exceeded guardrail {max:.1}%"
                ));
            }
        }
        if let Some(max) = self.config.max_error_rate {
            if metrics.ops > 0 && metrics.error_rate > max {
                return Some(format!(
                    "error rate {:.4} exceeded guardrail {max:.4}",
                    metrics.error_rate
                ));
            }
        }
        None
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}
