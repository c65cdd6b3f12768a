//! Run event payloads
//!
//! Events published over the run's broadcast channel. Delivery is
//! at-least-once in per-run sequence order; subscribers deduplicate on
//! `seq`, which is strictly increasing within a run across both event
//! kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;
use crate::stats::LatencyStats;

/// Emitted exactly once per phase entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseChangedEvent {
    pub phase: Phase,
    /// Present when entering WARMUP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_seconds: Option<u64>,
    /// Present when entering RUNNING
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_seconds: Option<u64>,
    /// Present for CANCELLING/CANCELLED (guardrail condition, user reason,
    /// or setup failure detail)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

impl PhaseChangedEvent {
    /// The JSON envelope subscribers see on the wire.
    pub fn to_wire_json(&self) -> serde_json::Value {
        serde_json::json!({
            "event": "PHASE_CHANGED",
            "data": self,
        })
    }
}

/// Periodic metric snapshot (~1 Hz) covering one interval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEvent {
    pub ops_per_sec: f64,
    pub latency: LatencyStats,
    pub total_ops: u64,
    pub errors: u64,
    /// Errors / total for the interval, 0.0 when nothing ran
    pub error_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_pct: Option<f64>,
    pub active_workers: u32,
    pub target_virtual_users: u32,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// Anything a run publishes to its subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEvent {
    PhaseChanged(PhaseChangedEvent),
    Metrics(MetricsEvent),
}

impl RunEvent {
    /// Per-run sequence number, strictly increasing across event kinds
    pub fn seq(&self) -> u64 {
        match self {
            Self::PhaseChanged(e) => e.seq,
            Self::Metrics(e) => e.seq,
        }
    }

    pub fn as_phase_changed(&self) -> Option<&PhaseChangedEvent> {
        match self {
            Self::PhaseChanged(e) => Some(e),
            Self::Metrics(_) => None,
        }
    }
}
