//! Worker supervision
//!
//! The supervisor launches worker tasks and keeps the bookkeeping the
//! orchestrator consults: last-seen heartbeat times, per-worker status,
//! readiness, and the DEAD marking sweep. Heartbeats themselves flow through
//! the orchestrator's inbox; the orchestrator feeds them in here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use querybench_common::{RunConfig, WorkerExit, WorkerHeartbeat, WorkerStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::MetricsRecorder;
use crate::pool::ConnectionPool;
use crate::target::ConnectionFactory;
use crate::worker::{run_worker, WorkerChannels, WorkerSpec};

struct WorkerState {
    status: WorkerStatus,
    last_seen: Instant,
    vus_tx: watch::Sender<u32>,
    join: Option<JoinHandle<WorkerExit>>,
    exit: Option<WorkerExit>,
}

/// Tracks every worker of one run
pub struct Supervisor {
    workers: HashMap<u32, WorkerState>,
    heartbeat_timeout: Duration,
}

impl Supervisor {
    /// Spawn `config.workers` worker tasks. Each worker owns an equal slice
    /// of the benchmark pool; the remainder goes to the low-numbered ones.
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        config: &RunConfig,
        pool: &Arc<ConnectionPool>,
        factory: &Arc<dyn ConnectionFactory>,
        recorder: &Arc<MetricsRecorder>,
        heartbeat_tx: mpsc::Sender<WorkerHeartbeat>,
        start_rx: &watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> Self {
        let now = Instant::now();
        let heartbeat_interval = Duration::from_secs(config.supervision.heartbeat_interval_seconds);
        let heartbeat_timeout =
            heartbeat_interval * config.supervision.missed_heartbeat_threshold;

        let slices = split_evenly(config.pool.size, config.workers);
        let mut workers = HashMap::new();
        for (id, slice) in slices.into_iter().enumerate() {
            let id = id as u32;
            let (vus_tx, vus_rx) = watch::channel(0u32);
            let spec = WorkerSpec {
                id,
                statement: config.statement.clone(),
                slice_size: slice as usize,
                connect_timeout: Duration::from_secs(config.pool.connect_timeout_seconds),
                start_timeout: Duration::from_secs(
                    config.supervision.start_signal_timeout_seconds,
                ),
                heartbeat_interval,
            };
            let channels = WorkerChannels {
                heartbeat_tx: heartbeat_tx.clone(),
                start_rx: start_rx.clone(),
                vus_rx,
                cancel: cancel.child_token(),
            };
            let join = tokio::spawn(run_worker(
                spec,
                Arc::clone(pool),
                Arc::clone(factory),
                Arc::clone(recorder),
                channels,
            ));
            workers.insert(
                id,
                WorkerState {
                    status: WorkerStatus::Initializing,
                    last_seen: now,
                    vus_tx,
                    join: Some(join),
                    exit: None,
                },
            );
        }
        info!(workers = workers.len(), "workers launched");
        Self {
            workers,
            heartbeat_timeout,
        }
    }

    /// Fold one heartbeat into the bookkeeping
    pub fn record_heartbeat(&mut self, heartbeat: &WorkerHeartbeat, now: Instant) {
        if let Some(state) = self.workers.get_mut(&heartbeat.worker_id) {
            state.last_seen = now;
            // DEAD is sticky; a late heartbeat never resurrects a worker
            if state.status != WorkerStatus::Dead {
                state.status = heartbeat.status;
            }
        }
    }

    /// Mark workers DEAD whose heartbeats stopped, returning the newly dead
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<u32> {
        let mut newly_dead = Vec::new();
        for (id, state) in &mut self.workers {
            if state.status != WorkerStatus::Dead
                && now.duration_since(state.last_seen) > self.heartbeat_timeout
            {
                warn!(worker_id = id, "worker missed heartbeats, marking DEAD");
                state.status = WorkerStatus::Dead;
                newly_dead.push(*id);
            }
        }
        newly_dead.sort_unstable();
        newly_dead
    }

    pub fn all_waiting(&self) -> bool {
        !self.workers.is_empty()
            && self
                .workers
                .values()
                .all(|w| w.status == WorkerStatus::Waiting)
    }

    pub fn healthy_count(&self) -> u32 {
        self.workers
            .values()
            .filter(|w| w.status != WorkerStatus::Dead)
            .count() as u32
    }

    pub fn all_dead(&self) -> bool {
        self.healthy_count() == 0
    }

    pub fn worker_count(&self) -> u32 {
        self.workers.len() as u32
    }

    /// Distribute a total virtual-user target across healthy workers,
    /// capped by the connections the pool actually holds. Returns the
    /// applied total; a shortfall is degradation, not failure.
    pub fn apply_target(&mut self, total: u32, pool_created: u32) -> u32 {
        let applied = total.min(pool_created);
        if applied < total {
            warn!(
                requested = total,
                applied,
                "scaling step exceeds pool capacity, degrading"
            );
        }

        let mut healthy: Vec<u32> = self
            .workers
            .iter()
            .filter(|(_, w)| w.status != WorkerStatus::Dead)
            .map(|(id, _)| *id)
            .collect();
        healthy.sort_unstable();
        if healthy.is_empty() {
            return 0;
        }

        let shares = split_evenly(applied, healthy.len() as u32);
        for (id, share) in healthy.into_iter().zip(shares) {
            if let Some(state) = self.workers.get_mut(&id) {
                let _ = state.vus_tx.send(share);
            }
        }
        applied
    }

    /// Abort a worker task outright, with no shutdown signal, the way a
    /// crashed worker process would vanish. Its status stays as last
    /// reported; the missed-heartbeat sweep is what marks it DEAD.
    pub fn abort_worker(&mut self, id: u32) {
        if let Some(join) = self.workers.get(&id).and_then(|w| w.join.as_ref()) {
            warn!(worker_id = id, "aborting worker task");
            join.abort();
        }
    }

    /// Park every worker at zero virtual users (used while draining)
    pub fn stop_load(&mut self) {
        for state in self.workers.values_mut() {
            let _ = state.vus_tx.send(0);
        }
    }

    /// Join every worker task, bounded by `grace` total
    pub async fn join_all(&mut self, grace: Duration) -> Vec<(u32, WorkerExit)> {
        let deadline = Instant::now() + grace;
        let mut exits = Vec::new();
        let mut ids: Vec<u32> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(state) = self.workers.get_mut(&id) else {
                continue;
            };
            let Some(join) = state.join.take() else {
                if let Some(exit) = state.exit {
                    exits.push((id, exit));
                }
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let exit = match tokio::time::timeout(remaining, join).await {
                Ok(Ok(exit)) => exit,
                Ok(Err(_)) => WorkerExit::SetupFailure,
                Err(_) => {
                    warn!(worker_id = id, "worker did not stop within grace, abandoning");
                    WorkerExit::SetupFailure
                }
            };
            state.exit = Some(exit);
            exits.push((id, exit));
        }
        exits
    }
}

/// Split `total` into `parts` near-equal shares (remainder to the front)
fn split_evenly(total: u32, parts: u32) -> Vec<u32> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let remainder = total % parts;
    (0..parts)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolKind;
    use crate::synthetic::{SyntheticFactory, SyntheticProfile};
    use querybench_common::{
        GuardrailConfig, PoolSettings, ScalingBounds, ScalingConfig, SloConfig,
        SupervisionSettings,
    };

    fn config(workers: u32, pool_size: u32) -> RunConfig {
        RunConfig {
            statement: "SELECT 1".into(),
            workers,
            warmup_seconds: 1,
            run_seconds: 5,
            scaling: ScalingConfig::Fixed {
                concurrent_connections: 4,
            },
            bounds: ScalingBounds::default(),
            pool: PoolSettings {
                size: pool_size,
                ..PoolSettings::default()
            },
            guardrails: GuardrailConfig::default(),
            slo: SloConfig::default(),
            supervision: SupervisionSettings::default(),
        }
    }

    fn launch_harness(
        config: &RunConfig,
    ) -> (
        Supervisor,
        mpsc::Receiver<WorkerHeartbeat>,
        watch::Sender<bool>,
        CancellationToken,
    ) {
        let factory: Arc<dyn ConnectionFactory> =
            Arc::new(SyntheticFactory::new(SyntheticProfile::default()));
        let pool = Arc::new(ConnectionPool::new(
            PoolKind::Benchmark,
            config.pool.size as usize,
            config.pool.max_parallel_connect,
        ));
        let recorder = Arc::new(MetricsRecorder::new());
        let (hb_tx, hb_rx) = mpsc::channel(256);
        let (start_tx, start_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let supervisor = Supervisor::launch(
            config,
            &pool,
            &factory,
            &recorder,
            hb_tx,
            &start_rx,
            &cancel,
        );
        (supervisor, hb_rx, start_tx, cancel)
    }

    #[test]
    fn test_split_evenly() {
        assert_eq!(split_evenly(10, 3), vec![4, 3, 3]);
        assert_eq!(split_evenly(9, 3), vec![3, 3, 3]);
        assert_eq!(split_evenly(2, 4), vec![1, 1, 0, 0]);
        assert_eq!(split_evenly(5, 0), Vec::<u32>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_requires_every_worker() {
        let config = config(3, 6);
        let (mut supervisor, mut hb_rx, _start_tx, cancel) = launch_harness(&config);
        assert!(!supervisor.all_waiting());

        // Feed heartbeats until all three report WAITING
        while !supervisor.all_waiting() {
            let hb = hb_rx.recv().await.unwrap();
            supervisor.record_heartbeat(&hb, Instant::now());
        }
        assert_eq!(supervisor.healthy_count(), 3);
        cancel.cancel();
        supervisor.join_all(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_marks_silent_workers_dead() {
        let config = config(2, 4);
        let (mut supervisor, mut hb_rx, _start_tx, cancel) = launch_harness(&config);

        while !supervisor.all_waiting() {
            let hb = hb_rx.recv().await.unwrap();
            supervisor.record_heartbeat(&hb, Instant::now());
        }

        // Default threshold is 3 missed 1s heartbeats
        let later = Instant::now() + Duration::from_secs(10);
        let dead = supervisor.sweep_stale(later);
        assert_eq!(dead, vec![0, 1]);
        assert!(supervisor.all_dead());

        // A late heartbeat does not resurrect
        let hb = WorkerHeartbeat::new(0, WorkerStatus::Running);
        supervisor.record_heartbeat(&hb, later);
        assert!(supervisor.all_dead());
        cancel.cancel();
        supervisor.join_all(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_worker_goes_silent_and_joins_as_failure() {
        let config = config(2, 4);
        let (mut supervisor, mut hb_rx, _start_tx, cancel) = launch_harness(&config);
        while !supervisor.all_waiting() {
            let hb = hb_rx.recv().await.unwrap();
            supervisor.record_heartbeat(&hb, Instant::now());
        }

        supervisor.abort_worker(0);
        // The abort itself changes no status; only the sweep does
        assert_eq!(supervisor.healthy_count(), 2);
        let later = Instant::now() + Duration::from_secs(10);
        supervisor.record_heartbeat(&WorkerHeartbeat::new(1, WorkerStatus::Waiting), later);
        let dead = supervisor.sweep_stale(later);
        assert_eq!(dead, vec![0]);
        assert_eq!(supervisor.healthy_count(), 1);

        cancel.cancel();
        let exits = supervisor.join_all(Duration::from_secs(5)).await;
        assert_eq!(exits[0], (0, WorkerExit::SetupFailure));
        assert_eq!(exits[1].1, WorkerExit::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_target_caps_at_pool_capacity() {
        let config = config(2, 4);
        let (mut supervisor, mut hb_rx, start_tx, cancel) = launch_harness(&config);
        while !supervisor.all_waiting() {
            let hb = hb_rx.recv().await.unwrap();
            supervisor.record_heartbeat(&hb, Instant::now());
        }
        start_tx.send(true).unwrap();

        // Pool only built 4 connections; a target of 10 degrades
        let applied = supervisor.apply_target(10, 4);
        assert_eq!(applied, 4);
        let applied = supervisor.apply_target(3, 4);
        assert_eq!(applied, 3);

        cancel.cancel();
        let exits = supervisor.join_all(Duration::from_secs(5)).await;
        assert!(exits.iter().all(|(_, exit)| *exit == WorkerExit::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_workers_excluded_from_distribution() {
        let config = config(2, 8);
        let (mut supervisor, mut hb_rx, _start_tx, cancel) = launch_harness(&config);
        while !supervisor.all_waiting() {
            let hb = hb_rx.recv().await.unwrap();
            supervisor.record_heartbeat(&hb, Instant::now());
        }

        supervisor.record_heartbeat(
            &WorkerHeartbeat::failed(1, "boom"),
            Instant::now(),
        );
        assert_eq!(supervisor.healthy_count(), 1);
        assert!(!supervisor.all_dead());

        // Whole target lands on the surviving worker
        let applied = supervisor.apply_target(5, 8);
        assert_eq!(applied, 5);
        cancel.cancel();
        supervisor.join_all(Duration::from_secs(5)).await;
    }
}
