//! Event publishing
//!
//! Fan-out of run events to any number of subscribers over a broadcast
//! channel. The publisher stamps every event with the run's next sequence
//! number under its own counter, so events leave in order regardless of
//! kind. Slow subscribers lag and miss events rather than stalling the run;
//! `subscribe_stream` surfaces that as a skip, and the dedup contract is
//! "at-least-once, dedupe by `seq`".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use querybench_common::{MetricsEvent, Phase, PhaseChangedEvent, RunEvent};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, trace};

use crate::metrics::IntervalMetrics;

/// Extra payload fields for specific phase entries
#[derive(Debug, Clone, Default)]
pub struct PhaseContext {
    pub warmup_seconds: Option<u64>,
    pub run_seconds: Option<u64>,
    pub reason: Option<String>,
}

struct Inner {
    sender: broadcast::Sender<RunEvent>,
    next_seq: AtomicU64,
    /// Events sent while no subscriber was attached
    unobserved: AtomicU64,
}

/// Ordered, sequenced event fan-out for one run
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            inner: Arc::new(Inner {
                sender,
                next_seq: AtomicU64::new(1),
                unobserved: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to raw broadcast delivery. Attach before starting the run
    /// to observe the full phase sequence.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.sender.subscribe()
    }

    /// Subscribe as a stream, skipping over lag gaps
    pub fn subscribe_stream(&self) -> impl Stream<Item = RunEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                debug!(missed, "subscriber lagged, events skipped");
                None
            }
        })
    }

    /// Emit the event for a phase entry, returning the stamped payload
    pub fn publish_phase(&self, phase: Phase, context: PhaseContext) -> PhaseChangedEvent {
        let event = PhaseChangedEvent {
            phase,
            warmup_seconds: context.warmup_seconds,
            run_seconds: context.run_seconds,
            reason: context.reason,
            seq: self.next_seq(),
            timestamp: Utc::now(),
        };
        self.send(RunEvent::PhaseChanged(event.clone()));
        event
    }

    /// Emit one interval's metric snapshot
    pub fn publish_metrics(
        &self,
        metrics: &IntervalMetrics,
        memory_used_pct: Option<f64>,
        active_workers: u32,
        target_virtual_users: u32,
    ) -> MetricsEvent {
        let event = MetricsEvent {
            ops_per_sec: metrics.ops_per_sec,
            latency: metrics.latency,
            total_ops: metrics.ops,
            errors: metrics.errors,
            error_rate: metrics.error_rate,
            memory_used_pct,
            active_workers,
            target_virtual_users,
            seq: self.next_seq(),
            timestamp: Utc::now(),
        };
        self.send(RunEvent::Metrics(event.clone()));
        event
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn send(&self, event: RunEvent) {
        if self.inner.sender.send(event).is_err() {
            // No subscribers attached; the run does not depend on them
            self.inner.unobserved.fetch_add(1, Ordering::Relaxed);
            trace!("event published with no subscribers");
        }
    }

    pub fn unobserved_count(&self) -> u64 {
        self.inner.unobserved.load(Ordering::Relaxed)
    }
}
