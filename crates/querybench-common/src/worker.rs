//! Worker status reporting types
//!
//! Workers report their lifecycle over heartbeats: INITIALIZING while the
//! benchmark-pool slice is being built, WAITING once ready for the start
//! signal, RUNNING during load, DEAD on unrecoverable failure. The
//! supervisor also marks a worker DEAD after missed heartbeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker lifecycle status carried in heartbeats
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
pub enum WorkerStatus {
    /// Building the benchmark-pool slice
    #[default]
    Initializing,
    /// Ready, waiting for the start signal
    Waiting,
    /// Issuing load
    Running,
    /// Failed or stopped heartbeating
    Dead,
}

/// A single heartbeat report from a worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerHeartbeat {
    pub worker_id: u32,
    pub status: WorkerStatus,
    pub timestamp: DateTime<Utc>,
    /// Populated when `status` is DEAD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerHeartbeat {
    pub fn new(worker_id: u32, status: WorkerStatus) -> Self {
        Self {
            worker_id,
            status,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failed(worker_id: u32, error: impl Into<String>) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Dead,
            timestamp: Utc::now(),
            error: Some(error.into()),
        }
    }
}

/// How a worker task finished, mirroring the process exit-code contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerExit {
    /// Clean shutdown after the stop signal
    Normal,
    /// General setup failure (start-signal timeout, bad workload)
    SetupFailure,
    /// Could not build the benchmark-pool slice
    PoolInitFailure,
}

impl WorkerExit {
    /// Exit code a standalone worker process would report
    pub fn code(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::SetupFailure => 1,
            Self::PoolInitFailure => 2,
        }
    }

    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&WorkerStatus::Waiting).unwrap();
        assert_eq!(json, "\"WAITING\"");
        assert_eq!("DEAD".parse::<WorkerStatus>().ok(), Some(WorkerStatus::Dead));
    }

    #[test]
    fn test_heartbeat_serialization_omits_empty_error() {
        let hb = WorkerHeartbeat::new(3, WorkerStatus::Running);
        let json = serde_json::to_string(&hb).unwrap();
        assert!(json.contains("\"worker_id\":3"));
        assert!(json.contains("\"status\":\"RUNNING\""));
        assert!(!json.contains("error"));

        let dead = WorkerHeartbeat::failed(3, "pool slice init failed");
        let json = serde_json::to_string(&dead).unwrap();
        assert!(json.contains("\"error\":\"pool slice init failed\""));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WorkerExit::Normal.code(), 0);
        assert_eq!(WorkerExit::SetupFailure.code(), 1);
        assert_eq!(WorkerExit::PoolInitFailure.code(), 2);
        assert!(!WorkerExit::Normal.is_failure());
        assert!(WorkerExit::PoolInitFailure.is_failure());
    }
}
