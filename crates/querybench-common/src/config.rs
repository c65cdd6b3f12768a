//! Run configuration
//!
//! Deserialized from JSON by the CLI or built programmatically by an
//! embedding application. Field-level checks use garde; cross-field rules
//! that garde cannot express live in [`RunConfig::validate`].

use std::path::{Path, PathBuf};

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::defaults;

/// Errors from loading or validating a run configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(#[from] garde::Report),

    #[error("invalid config: {0}")]
    Semantic(String),
}

impl ConfigError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Load-scaling mode for the measurement window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "load_mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalingConfig {
    /// Constant number of concurrent virtual users
    #[serde(rename = "CONCURRENCY")]
    Fixed { concurrent_connections: u32 },
    /// Step toward a target throughput, holding inside a hysteresis band
    Qps {
        target_qps: f64,
        /// Virtual users added/removed per adjustment
        #[serde(default = "default_qps_step")]
        step: u32,
        /// Half-width of the no-adjustment band around the target, as a
        /// fraction of target_qps
        #[serde(default = "default_hysteresis")]
        hysteresis: f64,
    },
    /// Climb a concurrency ladder until the SLO breaks
    #[serde(rename = "FIND_MAX_CONCURRENCY")]
    FindMax {
        start_concurrency: u32,
        concurrency_increment: u32,
        step_duration_seconds: u64,
    },
}

fn default_qps_step() -> u32 {
    4
}

fn default_hysteresis() -> f64 {
    0.05
}

impl ScalingConfig {
    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => "CONCURRENCY",
            Self::Qps { .. } => "QPS",
            Self::FindMax { .. } => "FIND_MAX_CONCURRENCY",
        }
    }
}

/// Clamp bounds for every scaling decision
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Validate)]
pub struct ScalingBounds {
    #[garde(range(min = 1))]
    pub min_virtual_users: u32,
    #[garde(range(min = 1))]
    pub max_virtual_users: u32,
}

impl Default for ScalingBounds {
    fn default() -> Self {
        Self {
            min_virtual_users: 1,
            max_virtual_users: 256,
        }
    }
}

/// Benchmark pool sizing and disposal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct PoolSettings {
    /// Connections created for the run's benchmark pool
    #[garde(range(min = 1))]
    pub size: u32,
    /// Minimum successful connections for the run to proceed; 0 derives
    /// half of `size` (rounded up)
    #[garde(skip)]
    pub min_viable: u32,
    #[garde(range(min = 1))]
    #[serde(default = "defaults::max_parallel_connect")]
    pub max_parallel_connect: usize,
    #[garde(range(min = 1))]
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_seconds: u64,
    #[garde(skip)]
    #[serde(default = "defaults::drain_grace_secs")]
    pub drain_grace_seconds: u64,
}

impl PoolSettings {
    /// Effective minimum viable connection count
    pub fn min_viable_connections(&self) -> u32 {
        if self.min_viable > 0 {
            self.min_viable
        } else {
            self.size.div_ceil(2)
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 16,
            min_viable: 0,
            max_parallel_connect: defaults::MAX_PARALLEL_CONNECT,
            connect_timeout_seconds: defaults::CONNECT_TIMEOUT_SECS,
            drain_grace_seconds: defaults::DRAIN_GRACE_SECS,
        }
    }
}

/// Cancellation guardrails, evaluated against each metric snapshot
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Validate)]
pub struct GuardrailConfig {
    /// Cancel when memory utilization exceeds this percentage
    #[garde(range(min = 0.0, max = 100.0))]
    #[serde(default)]
    pub max_memory_pct: Option<f64>,
    /// Cancel when the interval error rate exceeds this fraction
    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default)]
    pub max_error_rate: Option<f64>,
}

impl GuardrailConfig {
    pub fn is_enabled(&self) -> bool {
        self.max_memory_pct.is_some() || self.max_error_rate.is_some()
    }
}

/// Service-level objective used by the Find-Max ladder
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Validate)]
pub struct SloConfig {
    #[garde(range(min = 0.0))]
    #[serde(default)]
    pub p95_latency_ms: Option<f64>,
    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default)]
    pub max_error_rate: Option<f64>,
}

impl SloConfig {
    pub fn is_enabled(&self) -> bool {
        self.p95_latency_ms.is_some() || self.max_error_rate.is_some()
    }
}

/// Heartbeat and startup timing knobs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Validate)]
pub struct SupervisionSettings {
    #[garde(range(min = 1))]
    #[serde(default = "defaults::heartbeat_interval_secs")]
    pub heartbeat_interval_seconds: u64,
    #[garde(range(min = 1))]
    #[serde(default = "defaults::missed_heartbeat_threshold")]
    pub missed_heartbeat_threshold: u32,
    #[garde(range(min = 1))]
    #[serde(default = "defaults::start_signal_timeout_secs")]
    pub start_signal_timeout_seconds: u64,
    #[garde(range(min = 1))]
    #[serde(default = "defaults::readiness_timeout_secs")]
    pub readiness_timeout_seconds: u64,
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: defaults::HEARTBEAT_INTERVAL_SECS,
            missed_heartbeat_threshold: defaults::MISSED_HEARTBEAT_THRESHOLD,
            start_signal_timeout_seconds: defaults::START_SIGNAL_TIMEOUT_SECS,
            readiness_timeout_seconds: defaults::READINESS_TIMEOUT_SECS,
        }
    }
}

/// Complete configuration for one test run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct RunConfig {
    /// Statement every virtual user issues
    #[garde(length(min = 1))]
    #[serde(default = "defaults::default_statement")]
    pub statement: String,

    /// Worker tasks the supervisor launches
    #[garde(range(min = 1, max = 64))]
    #[serde(default = "defaults::default_workers")]
    pub workers: u32,

    #[garde(skip)]
    pub warmup_seconds: u64,

    #[garde(range(min = 1))]
    pub run_seconds: u64,

    #[garde(skip)]
    pub scaling: ScalingConfig,

    #[garde(dive)]
    #[serde(default)]
    pub bounds: ScalingBounds,

    #[garde(dive)]
    #[serde(default)]
    pub pool: PoolSettings,

    #[garde(dive)]
    #[serde(default)]
    pub guardrails: GuardrailConfig,

    #[garde(dive)]
    #[serde(default)]
    pub slo: SloConfig,

    #[garde(dive)]
    #[serde(default)]
    pub supervision: SupervisionSettings,
}

impl RunConfig {
    /// Load and validate a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw =
            std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Field-level (garde) plus cross-field validation
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        let bounds = &self.bounds;
        if bounds.min_virtual_users > bounds.max_virtual_users {
            return Err(ConfigError::Semantic(format!(
                "min_virtual_users {} exceeds max_virtual_users {}",
                bounds.min_virtual_users, bounds.max_virtual_users
            )));
        }
        if self.pool.min_viable > self.pool.size {
            return Err(ConfigError::Semantic(format!(
                "pool min_viable {} exceeds pool size {}",
                self.pool.min_viable, self.pool.size
            )));
        }
        match &self.scaling {
            ScalingConfig::Fixed {
                concurrent_connections,
            } => {
                if *concurrent_connections == 0 {
                    return Err(ConfigError::Semantic(
                        "concurrent_connections must be at least 1".into(),
                    ));
                }
            }
            ScalingConfig::Qps {
                target_qps,
                step,
                hysteresis,
            } => {
                if *target_qps <= 0.0 {
                    return Err(ConfigError::Semantic(
                        "target_qps must be positive".into(),
                    ));
                }
                if *step == 0 {
                    return Err(ConfigError::Semantic("qps step must be at least 1".into()));
                }
                if !(0.0..1.0).contains(hysteresis) {
                    return Err(ConfigError::Semantic(format!(
                        "hysteresis {hysteresis} must be in [0, 1)"
                    )));
                }
            }
            ScalingConfig::FindMax {
                start_concurrency,
                concurrency_increment,
                step_duration_seconds,
            } => {
                if *start_concurrency == 0 || *concurrency_increment == 0 {
                    return Err(ConfigError::Semantic(
                        "find-max start and increment must be at least 1".into(),
                    ));
                }
                if *step_duration_seconds == 0 {
                    return Err(ConfigError::Semantic(
                        "find-max step duration must be at least 1 second".into(),
                    ));
                }
                if !self.slo.is_enabled() {
                    return Err(ConfigError::Semantic(
                        "find-max mode requires at least one SLO threshold".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}
