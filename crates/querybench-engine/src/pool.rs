//! Connection pools
//!
//! Two kinds: the small, process-lifetime control pool for orchestration
//! queries, and the per-run benchmark pool sized from the run config.
//! Benchmark pool creation runs `connect()` in parallel, bounded by a
//! semaphore shared by every worker's slice, so the target never sees more
//! than `max_parallel_connect` simultaneous connection attempts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::target::{connect_with_timeout, ConnectionFactory, TargetConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PoolKind {
    Control,
    Benchmark,
}

/// Point-in-time view of a pool for logging and reports
#[derive(Debug, Clone)]
pub struct PoolHandle {
    pub kind: PoolKind,
    pub size: usize,
    pub max_parallel_connect: usize,
    pub created: usize,
    pub healthy: bool,
}

/// A pool of target connections with a free-list channel
pub struct ConnectionPool {
    kind: PoolKind,
    size: usize,
    max_parallel_connect: usize,
    free_tx: mpsc::Sender<Box<dyn TargetConnection>>,
    free_rx: Mutex<mpsc::Receiver<Box<dyn TargetConnection>>>,
    connect_gate: Arc<Semaphore>,
    created: AtomicUsize,
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(kind: PoolKind, size: usize, max_parallel_connect: usize) -> Self {
        let (free_tx, free_rx) = mpsc::channel(size.max(1));
        Self {
            kind,
            size,
            max_parallel_connect,
            free_tx,
            free_rx: Mutex::new(free_rx),
            connect_gate: Arc::new(Semaphore::new(max_parallel_connect.max(1))),
            created: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            kind: self.kind,
            size: self.size,
            max_parallel_connect: self.max_parallel_connect,
            created: self.created(),
            healthy: !self.closed.load(Ordering::SeqCst) && self.created() > 0,
        }
    }

    /// Create `count` connections in parallel, bounded by the pool's
    /// connect gate. Returns how many succeeded; failures are logged, not
    /// fatal here. Callers compare against their viability threshold.
    pub async fn populate(
        &self,
        factory: Arc<dyn ConnectionFactory>,
        count: usize,
        connect_timeout: Duration,
    ) -> usize {
        let mut tasks = JoinSet::new();
        for _ in 0..count {
            let gate = Arc::clone(&self.connect_gate);
            let factory = Arc::clone(&factory);
            let free_tx = self.free_tx.clone();
            tasks.spawn(async move {
                // Closed on drain only, so acquire cannot fail mid-populate
                let Ok(_permit) = gate.acquire().await else {
                    return false;
                };
                match connect_with_timeout(factory.as_ref(), connect_timeout).await {
                    Ok(conn) => free_tx.send(conn).await.is_ok(),
                    Err(e) => {
                        warn!(error = %e, "connection attempt failed");
                        false
                    }
                }
            });
        }

        let mut ok = 0usize;
        while let Some(result) = tasks.join_next().await {
            if matches!(result, Ok(true)) {
                ok += 1;
            }
        }
        self.created.fetch_add(ok, Ordering::SeqCst);
        debug!(kind = %self.kind, requested = count, created = ok, "pool slice populated");
        ok
    }

    /// Take a connection from the free list, waiting until one is released.
    /// Returns None once the pool is drained or the token fires.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Box<dyn TargetConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = tokio::select! {
            guard = self.free_rx.lock() => guard,
            _ = cancel.cancelled() => return None,
        };
        tokio::select! {
            conn = rx.recv() => {
                let conn = conn?;
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                Some(conn)
            }
            _ = cancel.cancelled() => None,
        }
    }

    /// Return a connection to the free list. After drain begins the
    /// connection is closed instead.
    pub async fn release(&self, conn: Box<dyn TargetConnection>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            conn.close().await;
            return;
        }
        if let Err(returned) = self.free_tx.try_send(conn) {
            // Channel full means the pool was resized down; just close.
            match returned {
                mpsc::error::TrySendError::Full(conn)
                | mpsc::error::TrySendError::Closed(conn) => conn.close().await,
            }
        }
    }

    /// Discard a connection that hit an unrecoverable error
    pub async fn discard(&self, conn: Box<dyn TargetConnection>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        conn.close().await;
    }

    /// Soft-close: wait up to `grace` for in-flight work to come back, then
    /// close every pooled connection.
    pub async fn drain(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + grace;
        while self.outstanding.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    kind = %self.kind,
                    outstanding = self.outstanding.load(Ordering::SeqCst),
                    "drain grace expired with connections still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut rx = self.free_rx.lock().await;
        rx.close();
        while let Some(conn) = rx.recv().await {
            conn.close().await;
        }
        debug!(kind = %self.kind, "pool drained");
    }
}
