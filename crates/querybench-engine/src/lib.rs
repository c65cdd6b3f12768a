//! querybench-engine - Benchmark orchestration engine
//!
//! Owns a test run end to end: connection pools against the target
//! database, supervised worker tasks generating load, scaling strategies,
//! cancellation guardrails, and the ordered event stream subscribers
//! consume.
//!
//! ## Modules
//!
//! - [`orchestrator`]: the run actor, [`Orchestrator`] and [`RunHandle`]
//! - [`pool`]: control-plane and benchmark connection pools
//! - [`target`]: target database traits and the Postgres factory
//! - [`synthetic`]: deterministic in-memory target for tests and dry runs
//! - [`worker`]: worker tasks and virtual-user loops
//! - [`supervisor`]: worker launch, heartbeat bookkeeping, DEAD marking
//! - [`scaling`]: Fixed, QPS-seeking, and Find-Max strategies
//! - [`guardrail`]: threshold-based cancellation
//! - [`events`]: sequenced broadcast event publishing
//! - [`metrics`]: operation recording and interval snapshots
//! - [`wait`]: bounded condition waits with backoff

pub mod events;
pub mod guardrail;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod scaling;
pub mod supervisor;
pub mod synthetic;
pub mod target;
pub mod wait;
pub mod worker;

pub use events::EventPublisher;
pub use metrics::{MemoryProbe, MetricsRecorder, ProcMemoryProbe, StaticMemoryProbe};
pub use orchestrator::{Orchestrator, RunCanceller, RunHandle, RunOutcome, RunStatus};
pub use pool::{ConnectionPool, PoolHandle, PoolKind};
pub use synthetic::{SyntheticCounters, SyntheticFactory, SyntheticProfile};
pub use target::{ConnectionFactory, PostgresFactory, TargetConnection};
