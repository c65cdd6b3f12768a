//! Run orchestration
//!
//! A run is owned by exactly one actor task. Commands (cancel), worker
//! heartbeats, and timers all arrive at that task's `select!` loop, so phase
//! transitions have a single writer and events leave in order. Callers hold
//! a [`RunHandle`]: subscribe to events, watch status, request cancellation,
//! await the outcome.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use querybench_common::{
    defaults, LatencyStats, Phase, RunConfig, RunId, SampleWindow, WorkerExit, WorkerHeartbeat,
    WorkerStatus,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventPublisher, PhaseContext};
use crate::guardrail::GuardrailMonitor;
use crate::metrics::{MemoryProbe, MetricsRecorder, ProcMemoryProbe};
use crate::pool::{ConnectionPool, PoolKind};
use crate::scaling::{strategy_for, Decision, ScalingStrategy};
use crate::supervisor::Supervisor;
use crate::target::ConnectionFactory;
use crate::wait::{wait_until, WaitConfig};

/// Commands a [`RunHandle`] can send into the actor
enum RunCommand {
    Cancel { reason: String },
    AbortWorker { worker_id: u32 },
}

/// Phase and entry time, observable through [`RunHandle::status`]
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub phase: Phase,
    pub since: DateTime<Utc>,
}

/// Final accounting for a finished run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub final_phase: Phase,
    /// Populated when the run was cancelled
    pub reason: Option<String>,
    pub total_ops: u64,
    pub total_errors: u64,
    /// Latency over the measurement window
    pub latency: LatencyStats,
    /// Seconds actually spent in RUNNING
    pub measured_seconds: f64,
    pub mean_ops_per_sec: f64,
    /// Find-Max result: highest target that sustained the SLO
    pub discovered_max: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase_history: Vec<(Phase, DateTime<Utc>)>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.final_phase == Phase::Completed
    }
}

/// Caller-side handle to a running test
pub struct RunHandle {
    run_id: RunId,
    publisher: EventPublisher,
    cmd_tx: mpsc::Sender<RunCommand>,
    status_rx: watch::Receiver<RunStatus>,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Subscribe to the run's event stream. Attach before phases advance to
    /// observe the full sequence.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<querybench_common::RunEvent> {
        self.publisher.subscribe()
    }

    pub fn status(&self) -> RunStatus {
        self.status_rx.borrow().clone()
    }

    /// Request a soft cancel. Idempotent: later requests are absorbed by
    /// the actor once it is already cancelling.
    pub async fn cancel(&self, reason: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(RunCommand::Cancel {
                reason: reason.into(),
            })
            .await;
    }

    /// Fault injection: abort one worker task outright, the way a crashed
    /// worker process would vanish. Supervision notices through the
    /// missed-heartbeat sweep and the run continues degraded while other
    /// workers survive.
    pub async fn inject_worker_crash(&self, worker_id: u32) {
        let _ = self
            .cmd_tx
            .send(RunCommand::AbortWorker { worker_id })
            .await;
    }

    /// Detached cancel handle, usable after `wait()` consumes the handle
    pub fn canceller(&self) -> RunCanceller {
        RunCanceller {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Wait for the run to reach a terminal phase
    pub async fn wait(self) -> Result<RunOutcome> {
        self.join.await.context("run task panicked")
    }
}

/// Cloneable cancel-only handle to a run
#[derive(Clone)]
pub struct RunCanceller {
    cmd_tx: mpsc::Sender<RunCommand>,
}

impl RunCanceller {
    pub async fn cancel(&self, reason: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(RunCommand::Cancel {
                reason: reason.into(),
            })
            .await;
    }
}

/// Entry point owning the control-plane pool, shared across runs
pub struct Orchestrator {
    factory: Arc<dyn ConnectionFactory>,
    control_pool: Arc<ConnectionPool>,
    memory_probe: Arc<dyn MemoryProbe>,
}

impl Orchestrator {
    /// Connect the control-plane pool. Fails if the target is unreachable,
    /// before any run is attempted.
    pub async fn connect(factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let control_pool = Arc::new(ConnectionPool::new(
            PoolKind::Control,
            defaults::CONTROL_POOL_SIZE as usize,
            defaults::MAX_PARALLEL_CONNECT,
        ));
        let created = control_pool
            .populate(
                Arc::clone(&factory),
                defaults::CONTROL_POOL_SIZE as usize,
                Duration::from_secs(defaults::CONNECT_TIMEOUT_SECS),
            )
            .await;
        anyhow::ensure!(
            created > 0,
            "control pool could not reach target {}",
            factory.target_name()
        );
        info!(target = factory.target_name(), created, "control pool ready");
        Ok(Self {
            factory,
            control_pool,
            memory_probe: Arc::new(ProcMemoryProbe),
        })
    }

    /// Replace the host memory source used by guardrails
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    /// Close control-plane connections
    pub async fn shutdown(&self) {
        self.control_pool
            .drain(Duration::from_secs(defaults::DRAIN_GRACE_SECS))
            .await;
    }

    /// Validate the configuration and start a run's actor task
    pub fn start_run(&self, config: RunConfig) -> Result<RunHandle> {
        config.validate_all().context("run config rejected")?;

        let run_id = querybench_common::new_run_id();
        let publisher = EventPublisher::new(defaults::EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (hb_tx, hb_rx) = mpsc::channel(1024);
        let (start_tx, start_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(RunStatus {
            phase: Phase::Prepared,
            since: Utc::now(),
        });

        let strategy = strategy_for(&config);
        let guardrail = GuardrailMonitor::new(config.guardrails);
        let pool = Arc::new(ConnectionPool::new(
            PoolKind::Benchmark,
            config.pool.size as usize,
            config.pool.max_parallel_connect,
        ));
        info!(
            run_id = %run_id,
            mode = config.scaling.mode_name(),
            workers = config.workers,
            pool_size = config.pool.size,
            "run prepared"
        );

        let actor = RunActor {
            run_id,
            config,
            factory: Arc::clone(&self.factory),
            control_pool: Arc::clone(&self.control_pool),
            memory_probe: Arc::clone(&self.memory_probe),
            publisher: publisher.clone(),
            status_tx,
            cmd_rx,
            hb_rx,
            hb_tx: Some(hb_tx),
            start_tx,
            start_rx,
            pool,
            recorder: Arc::new(MetricsRecorder::new()),
            window: SampleWindow::new(8),
            guardrail,
            strategy,
            worker_cancel: CancellationToken::new(),
            phase: Phase::Prepared,
            phase_history: vec![(Phase::Prepared, Utc::now())],
            applied_target: 0,
            discovered_max: None,
            started_at: Utc::now(),
        };
        let join = tokio::spawn(actor.run());

        Ok(RunHandle {
            run_id,
            publisher,
            cmd_tx,
            status_rx,
            join,
        })
    }
}

/// How a steady (WARMUP/RUNNING) phase loop ended
enum SteadyOutcome {
    DeadlineReached,
    CancelRequested(String),
    GuardrailBreached(String),
    AllWorkersDead,
    StopEarly(u32),
}

enum ReadinessOutcome {
    Ready,
    Fatal(String),
    Cancelled(String),
}

struct RunActor {
    run_id: RunId,
    config: RunConfig,
    factory: Arc<dyn ConnectionFactory>,
    control_pool: Arc<ConnectionPool>,
    memory_probe: Arc<dyn MemoryProbe>,
    publisher: EventPublisher,
    status_tx: watch::Sender<RunStatus>,
    cmd_rx: mpsc::Receiver<RunCommand>,
    hb_rx: mpsc::Receiver<WorkerHeartbeat>,
    hb_tx: Option<mpsc::Sender<WorkerHeartbeat>>,
    start_tx: watch::Sender<bool>,
    start_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    recorder: Arc<MetricsRecorder>,
    window: SampleWindow,
    guardrail: GuardrailMonitor,
    strategy: Box<dyn ScalingStrategy>,
    worker_cancel: CancellationToken,
    phase: Phase,
    phase_history: Vec<(Phase, DateTime<Utc>)>,
    applied_target: u32,
    discovered_max: Option<u32>,
    started_at: DateTime<Utc>,
}

impl RunActor {
    async fn run(mut self) -> RunOutcome {
        self.started_at = Utc::now();
        self.enter(Phase::Initializing, PhaseContext::default());

        if let Err(e) = self.preflight().await {
            return self
                .fail_before_workers(format!("target preflight failed: {e:#}"))
                .await;
        }

        let hb_tx = match self.hb_tx.take() {
            Some(tx) => tx,
            None => {
                return self
                    .fail_before_workers("heartbeat channel already consumed".to_string())
                    .await;
            }
        };
        let mut sup = Supervisor::launch(
            &self.config,
            &self.pool,
            &self.factory,
            &self.recorder,
            hb_tx,
            &self.start_rx,
            &self.worker_cancel,
        );

        match self.await_readiness(&mut sup).await {
            ReadinessOutcome::Ready => {}
            ReadinessOutcome::Fatal(reason) => return self.fail_setup(&mut sup, reason).await,
            ReadinessOutcome::Cancelled(reason) => {
                return self.cancel_run(&mut sup, reason).await;
            }
        }

        // Readiness reached: the warmup timer starts now, never earlier
        let warmup_seconds = self.config.warmup_seconds;
        self.enter(
            Phase::Warmup,
            PhaseContext {
                warmup_seconds: Some(warmup_seconds),
                ..PhaseContext::default()
            },
        );
        let _ = self.start_tx.send(true);
        let initial = self.strategy.initial_target();
        self.applied_target = sup.apply_target(initial, self.pool.created() as u32);

        if warmup_seconds > 0 {
            match self
                .steady_phase(&mut sup, Duration::from_secs(warmup_seconds), false)
                .await
            {
                SteadyOutcome::DeadlineReached | SteadyOutcome::StopEarly(_) => {}
                SteadyOutcome::CancelRequested(reason)
                | SteadyOutcome::GuardrailBreached(reason) => {
                    return self.cancel_run(&mut sup, reason).await;
                }
                SteadyOutcome::AllWorkersDead => {
                    return self
                        .cancel_run(&mut sup, "all workers dead".to_string())
                        .await;
                }
            }
        }

        // Measurement window: warmup traffic does not count
        let run_seconds = self.config.run_seconds;
        self.recorder.reset();
        self.window = SampleWindow::new(8);
        self.enter(
            Phase::Running,
            PhaseContext {
                run_seconds: Some(run_seconds),
                ..PhaseContext::default()
            },
        );
        let measure_started = Instant::now();
        let outcome = self
            .steady_phase(&mut sup, Duration::from_secs(run_seconds), true)
            .await;
        let measured = measure_started.elapsed();

        match outcome {
            SteadyOutcome::DeadlineReached => self.finish(&mut sup, measured).await,
            SteadyOutcome::StopEarly(max) => {
                info!(run_id = %self.run_id, max_sustainable = max, "find-max ceiling reached");
                self.discovered_max = Some(max);
                self.finish(&mut sup, measured).await
            }
            SteadyOutcome::CancelRequested(reason) | SteadyOutcome::GuardrailBreached(reason) => {
                self.cancel_run(&mut sup, reason).await
            }
            SteadyOutcome::AllWorkersDead => {
                self.cancel_run(&mut sup, "all workers dead".to_string())
                    .await
            }
        }
    }

    /// Record a phase entry, emitting the event for observable phases.
    /// PREPARED and INITIALIZING are internal; subscribers first hear
    /// WARMUP (or a terminal phase on setup failure).
    fn enter(&mut self, phase: Phase, context: PhaseContext) {
        debug_assert!(self.phase.can_transition_to(phase), "{} -> {phase}", self.phase);
        self.phase = phase;
        let now = Utc::now();
        self.phase_history.push((phase, now));
        let _ = self.status_tx.send(RunStatus { phase, since: now });
        if !matches!(phase, Phase::Prepared | Phase::Initializing) {
            self.publisher.publish_phase(phase, context);
        }
        info!(run_id = %self.run_id, phase = %phase, "phase entered");
    }

    /// Prove the target answers the workload statement before building a
    /// benchmark pool against it. Uses the control-plane pool.
    async fn preflight(&self) -> Result<()> {
        let pool = Arc::clone(&self.control_pool);
        let statement = self.config.statement.clone();
        let cancel = self.worker_cancel.clone();
        let check_cancel = cancel.clone();
        wait_until(
            WaitConfig {
                timeout: Duration::from_secs(self.config.pool.connect_timeout_seconds),
                ..WaitConfig::default()
            },
            &cancel,
            move || {
                let pool = Arc::clone(&pool);
                let statement = statement.clone();
                let cancel = check_cancel.clone();
                async move {
                    let Some(mut conn) = pool.acquire(&cancel).await else {
                        return Ok(false);
                    };
                    match conn.execute(&statement).await {
                        Ok(()) => {
                            pool.release(conn).await;
                            Ok(true)
                        }
                        Err(e) => {
                            debug!(error = %e, "preflight attempt failed");
                            pool.discard(conn).await;
                            Ok(false)
                        }
                    }
                }
            },
            "target preflight",
        )
        .await
    }

    /// Wait for every worker to report WAITING, bounded by the readiness
    /// timeout. A DEAD heartbeat during setup is fatal for the run.
    async fn await_readiness(&mut self, sup: &mut Supervisor) -> ReadinessOutcome {
        let deadline =
            Instant::now() + Duration::from_secs(self.config.supervision.readiness_timeout_seconds);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return ReadinessOutcome::Fatal(format!(
                        "workers not ready within {}s",
                        self.config.supervision.readiness_timeout_seconds
                    ));
                }
                Some(hb) = self.hb_rx.recv() => {
                    sup.record_heartbeat(&hb, Instant::now());
                    if hb.status == WorkerStatus::Dead {
                        let detail = hb.error.unwrap_or_else(|| "no detail".to_string());
                        return ReadinessOutcome::Fatal(format!(
                            "worker {} failed during setup: {detail}",
                            hb.worker_id
                        ));
                    }
                    if sup.all_waiting() {
                        let created = self.pool.created() as u32;
                        let min_viable = self.config.pool.min_viable_connections();
                        if created < min_viable {
                            return ReadinessOutcome::Fatal(format!(
                                "benchmark pool created {created}/{} connections, below minimum viable {min_viable}",
                                self.config.pool.size
                            ));
                        }
                        if created < self.config.pool.size {
                            warn!(
                                run_id = %self.run_id,
                                created,
                                configured = self.config.pool.size,
                                "benchmark pool degraded"
                            );
                        }
                        return ReadinessOutcome::Ready;
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    RunCommand::Cancel { reason } => {
                        return ReadinessOutcome::Cancelled(reason);
                    }
                    RunCommand::AbortWorker { worker_id } => sup.abort_worker(worker_id),
                }
            }
        }
    }

    /// Shared WARMUP/RUNNING loop: heartbeats, liveness sweep, snapshots,
    /// guardrails, and (while measuring) scaling decisions.
    async fn steady_phase(
        &mut self,
        sup: &mut Supervisor,
        duration: Duration,
        measuring: bool,
    ) -> SteadyOutcome {
        let phase_started = Instant::now();
        let deadline = phase_started + duration;
        let tick = Duration::from_secs(defaults::SNAPSHOT_INTERVAL_SECS);
        let mut snapshot = tokio::time::interval_at(phase_started + tick, tick);
        snapshot.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_snapshot = phase_started;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return SteadyOutcome::DeadlineReached,
                Some(hb) = self.hb_rx.recv() => {
                    sup.record_heartbeat(&hb, Instant::now());
                    if hb.status == WorkerStatus::Dead && sup.all_dead() {
                        return SteadyOutcome::AllWorkersDead;
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    RunCommand::Cancel { reason } => {
                        return SteadyOutcome::CancelRequested(reason);
                    }
                    RunCommand::AbortWorker { worker_id } => sup.abort_worker(worker_id),
                },
                now = snapshot.tick() => {
                    let newly_dead = sup.sweep_stale(now);
                    if !newly_dead.is_empty() {
                        if sup.all_dead() {
                            return SteadyOutcome::AllWorkersDead;
                        }
                        // Redistribute the current target over the survivors
                        self.applied_target =
                            sup.apply_target(self.applied_target, self.pool.created() as u32);
                    }

                    let interval = self
                        .recorder
                        .drain_interval(now.duration_since(last_snapshot));
                    last_snapshot = now;
                    let memory = self.memory_probe.used_pct();
                    self.publisher.publish_metrics(
                        &interval,
                        memory,
                        sup.healthy_count(),
                        self.applied_target,
                    );
                    self.window.push(interval.perf_sample());

                    if let Some(reason) = self.guardrail.check(&interval, memory) {
                        return SteadyOutcome::GuardrailBreached(reason);
                    }

                    if measuring {
                        match self
                            .strategy
                            .next_target(phase_started.elapsed(), &self.window)
                        {
                            Decision::Hold => {}
                            Decision::Adjust(target) => {
                                debug!(run_id = %self.run_id, target, "scaling adjustment");
                                self.applied_target =
                                    sup.apply_target(target, self.pool.created() as u32);
                            }
                            Decision::StopEarly { max_sustainable } => {
                                return SteadyOutcome::StopEarly(max_sustainable);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stop load, drain the benchmark pool, join workers
    async fn teardown(&mut self, sup: &mut Supervisor) -> Vec<(u32, WorkerExit)> {
        sup.stop_load();
        self.worker_cancel.cancel();
        let grace = Duration::from_secs(self.config.pool.drain_grace_seconds);
        self.pool.drain(grace).await;
        let exits = sup.join_all(grace).await;
        for (id, exit) in &exits {
            if exit.is_failure() {
                debug!(worker_id = id, exit = %exit, code = exit.code(), "worker exit");
            }
        }
        exits
    }

    async fn finish(mut self, sup: &mut Supervisor, measured: Duration) -> RunOutcome {
        self.enter(Phase::Processing, PhaseContext::default());
        self.teardown(sup).await;
        self.enter(Phase::Completed, PhaseContext::default());
        self.outcome(None, measured)
    }

    /// Graceful cancel: drain in-flight work under the grace period
    async fn cancel_run(mut self, sup: &mut Supervisor, reason: String) -> RunOutcome {
        self.enter(
            Phase::Cancelling,
            PhaseContext {
                reason: Some(reason.clone()),
                ..PhaseContext::default()
            },
        );
        self.teardown(sup).await;
        self.enter(
            Phase::Cancelled,
            PhaseContext {
                reason: Some(reason.clone()),
                ..PhaseContext::default()
            },
        );
        self.outcome(Some(reason), Duration::ZERO)
    }

    /// Fatal setup failure with workers launched: straight to CANCELLED
    async fn fail_setup(mut self, sup: &mut Supervisor, reason: String) -> RunOutcome {
        warn!(run_id = %self.run_id, reason = %reason, "run failed during setup");
        self.teardown(sup).await;
        self.enter(
            Phase::Cancelled,
            PhaseContext {
                reason: Some(reason.clone()),
                ..PhaseContext::default()
            },
        );
        self.outcome(Some(reason), Duration::ZERO)
    }

    /// Fatal failure before any worker existed
    async fn fail_before_workers(mut self, reason: String) -> RunOutcome {
        warn!(run_id = %self.run_id, reason = %reason, "run failed before workers launched");
        self.enter(
            Phase::Cancelled,
            PhaseContext {
                reason: Some(reason.clone()),
                ..PhaseContext::default()
            },
        );
        self.outcome(Some(reason), Duration::ZERO)
    }

    fn outcome(&self, reason: Option<String>, measured: Duration) -> RunOutcome {
        let (total_ops, total_errors) = self.recorder.totals();
        let measured_seconds = measured.as_secs_f64();
        RunOutcome {
            run_id: self.run_id,
            final_phase: self.phase,
            reason,
            total_ops,
            total_errors,
            latency: self.recorder.window_stats(),
            measured_seconds,
            mean_ops_per_sec: if measured_seconds > 0.0 {
                total_ops as f64 / measured_seconds
            } else {
                0.0
            },
            discovered_max: self.discovered_max,
            started_at: self.started_at,
            finished_at: Utc::now(),
            phase_history: self.phase_history.clone(),
        }
    }
}
