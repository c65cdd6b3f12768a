//! Synthetic target for tests and dry runs
//!
//! Behaves like a database with a fixed per-query latency and deterministic,
//! configurable failure injection. No randomness, so runs against it are
//! reproducible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::target::{ConnectError, ConnectionFactory, QueryError, TargetConnection};

/// Shared observation counters for assertions and dry-run summaries
#[derive(Debug, Default)]
pub struct SyntheticCounters {
    pub connects_attempted: AtomicU64,
    pub connects_failed: AtomicU64,
    pub queries: AtomicU64,
    pub query_failures: AtomicU64,
    /// High-water mark of concurrent in-flight `connect()` calls
    pub max_concurrent_connects: AtomicU64,
    in_flight_connects: AtomicU64,
}

impl SyntheticCounters {
    fn enter_connect(&self) {
        self.connects_attempted.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight_connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_connects
            .fetch_max(now, Ordering::SeqCst);
    }

    fn exit_connect(&self) {
        self.in_flight_connects.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Behavior knobs for the synthetic target
#[derive(Debug, Clone)]
pub struct SyntheticProfile {
    /// Simulated time to establish a connection
    pub connect_latency: Duration,
    /// Simulated per-query latency
    pub query_latency: Duration,
    /// Fail the first N connection attempts
    pub failing_connects: u64,
    /// When > 0, connection attempts beyond the Nth fail
    pub connect_budget: u64,
    /// When > 0, connection attempts beyond the Nth never complete
    pub stall_connects_after: u64,
    /// When > 0, every Nth query returns an execution error
    pub fail_every_nth_query: u64,
}

impl Default for SyntheticProfile {
    fn default() -> Self {
        Self {
            connect_latency: Duration::from_millis(5),
            query_latency: Duration::from_millis(2),
            failing_connects: 0,
            connect_budget: 0,
            stall_connects_after: 0,
            fail_every_nth_query: 0,
        }
    }
}

/// Factory producing synthetic connections
pub struct SyntheticFactory {
    profile: SyntheticProfile,
    counters: Arc<SyntheticCounters>,
}

impl SyntheticFactory {
    pub fn new(profile: SyntheticProfile) -> Self {
        Self {
            profile,
            counters: Arc::new(SyntheticCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<SyntheticCounters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl ConnectionFactory for SyntheticFactory {
    async fn connect(&self) -> Result<Box<dyn TargetConnection>, ConnectError> {
        self.counters.enter_connect();
        if self.profile.stall_connects_after > 0
            && self.counters.connects_attempted.load(Ordering::SeqCst)
                > self.profile.stall_connects_after
        {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.profile.connect_latency).await;
        self.counters.exit_connect();

        let attempt = self.counters.connects_attempted.load(Ordering::SeqCst);
        let over_budget =
            self.profile.connect_budget > 0 && attempt > self.profile.connect_budget;
        if attempt <= self.profile.failing_connects || over_budget {
            self.counters.connects_failed.fetch_add(1, Ordering::SeqCst);
            return Err(ConnectError(format!(
                "synthetic connect failure (attempt {attempt})"
            )));
        }

        Ok(Box::new(SyntheticConnection {
            profile: self.profile.clone(),
            counters: Arc::clone(&self.counters),
        }))
    }

    fn target_name(&self) -> &str {
        "synthetic"
    }
}

struct SyntheticConnection {
    profile: SyntheticProfile,
    counters: Arc<SyntheticCounters>,
}

#[async_trait]
impl TargetConnection for SyntheticConnection {
    async fn execute(&mut self, _statement: &str) -> Result<(), QueryError> {
        tokio::time::sleep(self.profile.query_latency).await;
        let n = self.counters.queries.fetch_add(1, Ordering::SeqCst) + 1;
        if self.profile.fail_every_nth_query > 0 && n % self.profile.fail_every_nth_query == 0 {
            self.counters.query_failures.fetch_add(1, Ordering::SeqCst);
            return Err(QueryError::Execution("synthetic query failure".into()));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {}
}
