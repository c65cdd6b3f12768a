//! Test-run lifecycle phases
//!
//! A run moves forward through `PREPARED → INITIALIZING → WARMUP → RUNNING →
//! PROCESSING → COMPLETED`, or detours into `CANCELLING → CANCELLED` from any
//! non-terminal phase. Transitions are strictly monotonic in the order below
//! and terminal phases are absorbing.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a test run
///
/// The declaration order is the lifecycle order; `rank()` exposes it so the
/// orchestrator can assert forward-only progress.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Run created, nothing started yet
    #[default]
    Prepared,
    /// Benchmark pool creation and worker startup in progress
    Initializing,
    /// Workers issuing load to prime caches; metrics not authoritative
    Warmup,
    /// Measurement window, scaling strategy active
    Running,
    /// Load stopped, final accounting in progress
    Processing,
    /// Run finished normally
    Completed,
    /// Cancel requested, draining in-flight work
    Cancelling,
    /// Run terminated before completion
    Cancelled,
}

impl Phase {
    /// Position in the lifecycle order. CANCELLING/CANCELLED sort after the
    /// normal path so that any detour still moves the rank forward.
    pub fn rank(self) -> u8 {
        match self {
            Self::Prepared => 0,
            Self::Initializing => 1,
            Self::Warmup => 2,
            Self::Running => 3,
            Self::Processing => 4,
            Self::Completed => 5,
            Self::Cancelling => 6,
            Self::Cancelled => 7,
        }
    }

    /// Check if the phase is terminal (no further transitions allowed)
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether a direct transition from `self` to `next` is legal
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // Normal forward path
            (Self::Prepared, Self::Initializing)
            | (Self::Initializing, Self::Warmup)
            | (Self::Warmup, Self::Running)
            | (Self::Running, Self::Processing)
            | (Self::Processing, Self::Completed) => true,
            // Soft cancel from anywhere non-terminal
            (_, Self::Cancelling) => true,
            (Self::Cancelling, Self::Cancelled) => true,
            // Fatal setup failure skips the drain
            (Self::Prepared | Self::Initializing, Self::Cancelled) => true,
            _ => false,
        }
    }

    /// Parse from string, returning None for unknown values
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}
