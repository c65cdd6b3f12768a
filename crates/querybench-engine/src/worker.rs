//! Worker tasks
//!
//! Each worker builds its slice of the benchmark pool, reports heartbeats on
//! a fixed interval, waits for the orchestrator's start signal, then runs a
//! resizable set of virtual-user loops. Workers never decide run phase; they
//! follow the start/target/cancel signals and report status upward.

use std::sync::Arc;
use std::time::Duration;

use querybench_common::{WorkerExit, WorkerHeartbeat, WorkerStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::MetricsRecorder;
use crate::pool::ConnectionPool;
use crate::target::{ConnectionFactory, QueryError};

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: u32,
    pub statement: String,
    /// Connections this worker contributes to the benchmark pool
    pub slice_size: usize,
    pub connect_timeout: Duration,
    pub start_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Channels wiring a worker to its supervisor
pub struct WorkerChannels {
    pub heartbeat_tx: mpsc::Sender<WorkerHeartbeat>,
    pub start_rx: watch::Receiver<bool>,
    /// This worker's virtual-user target
    pub vus_rx: watch::Receiver<u32>,
    pub cancel: CancellationToken,
}

struct VirtualUser {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Worker entry point. The returned [`WorkerExit`] mirrors the process
/// exit-code contract; the supervisor also learns of failures through the
/// final heartbeat.
pub async fn run_worker(
    spec: WorkerSpec,
    pool: Arc<ConnectionPool>,
    factory: Arc<dyn ConnectionFactory>,
    recorder: Arc<MetricsRecorder>,
    mut channels: WorkerChannels,
) -> WorkerExit {
    let mut heartbeat = tokio::time::interval(spec.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    send_heartbeat(&channels.heartbeat_tx, spec.id, WorkerStatus::Initializing).await;

    // Build this worker's pool slice, heartbeating while it runs
    let populate = pool.populate(Arc::clone(&factory), spec.slice_size, spec.connect_timeout);
    tokio::pin!(populate);
    let created = loop {
        tokio::select! {
            created = &mut populate => break created,
            _ = heartbeat.tick() => {
                send_heartbeat(&channels.heartbeat_tx, spec.id, WorkerStatus::Initializing).await;
            }
            _ = channels.cancel.cancelled() => {
                debug!(worker_id = spec.id, "cancelled during pool init");
                return WorkerExit::Normal;
            }
        }
    };

    if created == 0 && spec.slice_size > 0 {
        let message = format!("pool slice init failed: 0/{} connections", spec.slice_size);
        let _ = channels
            .heartbeat_tx
            .send(WorkerHeartbeat::failed(spec.id, &message))
            .await;
        return WorkerExit::PoolInitFailure;
    }
    if created < spec.slice_size {
        warn!(
            worker_id = spec.id,
            created,
            requested = spec.slice_size,
            "pool slice degraded"
        );
    }

    send_heartbeat(&channels.heartbeat_tx, spec.id, WorkerStatus::Waiting).await;

    // Wait for the start signal, bounded
    let start_deadline = tokio::time::sleep(spec.start_timeout);
    tokio::pin!(start_deadline);
    loop {
        tokio::select! {
            changed = channels.start_rx.changed() => {
                if changed.is_err() {
                    // Orchestrator dropped the sender; run is over
                    return WorkerExit::Normal;
                }
                if *channels.start_rx.borrow() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                send_heartbeat(&channels.heartbeat_tx, spec.id, WorkerStatus::Waiting).await;
            }
            _ = &mut start_deadline => {
                let message = format!(
                    "start signal not received within {:?}",
                    spec.start_timeout
                );
                let _ = channels
                    .heartbeat_tx
                    .send(WorkerHeartbeat::failed(spec.id, &message))
                    .await;
                return WorkerExit::SetupFailure;
            }
            _ = channels.cancel.cancelled() => return WorkerExit::Normal,
        }
    }

    info!(worker_id = spec.id, "starting load");
    send_heartbeat(&channels.heartbeat_tx, spec.id, WorkerStatus::Running).await;

    let mut users: Vec<VirtualUser> = Vec::new();
    resize_users(
        &mut users,
        *channels.vus_rx.borrow() as usize,
        &spec,
        &pool,
        &recorder,
        &channels.cancel,
    );

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                send_heartbeat(&channels.heartbeat_tx, spec.id, WorkerStatus::Running).await;
            }
            changed = channels.vus_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let target = *channels.vus_rx.borrow() as usize;
                resize_users(&mut users, target, &spec, &pool, &recorder, &channels.cancel);
            }
            _ = channels.cancel.cancelled() => break,
        }
    }

    // Soft stop: cancel every virtual user and wait for in-flight queries
    for user in &users {
        user.token.cancel();
    }
    for user in users {
        let _ = user.handle.await;
    }
    debug!(worker_id = spec.id, "worker stopped");
    WorkerExit::Normal
}

async fn send_heartbeat(tx: &mpsc::Sender<WorkerHeartbeat>, worker_id: u32, status: WorkerStatus) {
    let _ = tx.send(WorkerHeartbeat::new(worker_id, status)).await;
}

fn resize_users(
    users: &mut Vec<VirtualUser>,
    target: usize,
    spec: &WorkerSpec,
    pool: &Arc<ConnectionPool>,
    recorder: &Arc<MetricsRecorder>,
    cancel: &CancellationToken,
) {
    while users.len() > target {
        if let Some(user) = users.pop() {
            user.token.cancel();
            drop(user.handle);
        }
    }
    while users.len() < target {
        let token = cancel.child_token();
        let handle = tokio::spawn(virtual_user(
            Arc::clone(pool),
            spec.statement.clone(),
            Arc::clone(recorder),
            token.clone(),
        ));
        users.push(VirtualUser { token, handle });
    }
    debug!(worker_id = spec.id, virtual_users = users.len(), "virtual users resized");
}

/// One virtual user: acquire, execute, record, release, repeat
async fn virtual_user(
    pool: Arc<ConnectionPool>,
    statement: String,
    recorder: Arc<MetricsRecorder>,
    token: CancellationToken,
) {
    while !token.is_cancelled() {
        let Some(mut conn) = pool.acquire(&token).await else {
            break;
        };
        let started = tokio::time::Instant::now();
        let result = conn.execute(&statement).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(()) => {
                recorder.record(latency_ms, true);
                pool.release(conn).await;
            }
            Err(QueryError::ConnectionLost(reason)) => {
                recorder.record(latency_ms, false);
                warn!(reason = %reason, "connection dropped, discarding");
                pool.discard(conn).await;
            }
            Err(QueryError::Execution(_)) => {
                recorder.record(latency_ms, false);
                pool.release(conn).await;
            }
        }
    }
}
