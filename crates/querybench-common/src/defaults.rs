//! Default values shared between the engine and configuration parsing.
//!
//! Kept in one place so serde `default =` functions and the engine's
//! hard limits cannot drift apart.

/// Heartbeat interval for worker status reports (seconds)
pub const HEARTBEAT_INTERVAL_SECS: u64 = 1;

/// Missed heartbeats before a worker is marked DEAD
pub const MISSED_HEARTBEAT_THRESHOLD: u32 = 3;

/// How long a worker waits for the start signal before failing (seconds)
pub const START_SIGNAL_TIMEOUT_SECS: u64 = 120;

/// How long the orchestrator waits for all workers to report WAITING (seconds)
pub const READINESS_TIMEOUT_SECS: u64 = 120;

/// Grace period for in-flight queries when draining a pool (seconds)
pub const DRAIN_GRACE_SECS: u64 = 10;

/// Upper bound on concurrent `connect()` calls during pool creation
pub const MAX_PARALLEL_CONNECT: usize = 8;

/// Per-connection connect timeout (seconds)
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Control-plane pool size, independent of benchmark load
pub const CONTROL_POOL_SIZE: u32 = 4;

/// Metric snapshot, guardrail, and scaling adjustment cadence (seconds)
pub const SNAPSHOT_INTERVAL_SECS: u64 = 1;

/// Event broadcast channel capacity
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub fn heartbeat_interval_secs() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}

pub fn missed_heartbeat_threshold() -> u32 {
    MISSED_HEARTBEAT_THRESHOLD
}

pub fn start_signal_timeout_secs() -> u64 {
    START_SIGNAL_TIMEOUT_SECS
}

pub fn readiness_timeout_secs() -> u64 {
    READINESS_TIMEOUT_SECS
}

pub fn drain_grace_secs() -> u64 {
    DRAIN_GRACE_SECS
}

pub fn max_parallel_connect() -> usize {
    MAX_PARALLEL_CONNECT
}

pub fn connect_timeout_secs() -> u64 {
    CONNECT_TIMEOUT_SECS
}

pub fn default_workers() -> u32 {
    1
}

pub fn default_statement() -> String {
    "SELECT 1".to_string()
}
