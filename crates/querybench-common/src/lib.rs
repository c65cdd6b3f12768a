//! querybench-common - Shared types for the load-testing engine
//!
//! This crate provides the types shared between the orchestration engine and
//! its embedders, without pulling in the runtime or database dependencies.
//!
//! ## Modules
//!
//! - [`config`]: Run configuration and validation
//! - [`defaults`]: Default configuration values
//! - [`events`]: Phase-change and metric events published to subscribers
//! - [`phase`]: Test-run lifecycle phases and transition rules
//! - [`stats`]: Latency percentiles and the rolling sample window
//! - [`worker`]: Worker status, heartbeats, and exit classification

pub mod config;
pub mod defaults;
pub mod events;
pub mod phase;
pub mod stats;
pub mod worker;

// Re-export commonly used types
pub use config::{
    ConfigError, GuardrailConfig, PoolSettings, RunConfig, ScalingBounds, ScalingConfig,
    SloConfig, SupervisionSettings,
};
pub use events::{MetricsEvent, PhaseChangedEvent, RunEvent};
pub use phase::Phase;
pub use stats::{LatencyStats, PerfSample, SampleWindow};
pub use worker::{WorkerExit, WorkerHeartbeat, WorkerStatus};

/// Identifier for a test run (UUIDv7, time-ordered)
pub type RunId = uuid::Uuid;

/// Allocate a new run id
pub fn new_run_id() -> RunId {
    uuid::Uuid::now_v7()
}
