//! End-to-end run lifecycle tests against the synthetic target.
//!
//! All tests run under a paused clock, so warmup and measurement windows
//! elapse instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use querybench_common::{
    GuardrailConfig, Phase, PoolSettings, RunConfig, RunEvent, ScalingBounds, ScalingConfig,
    SloConfig, SupervisionSettings,
};
use querybench_engine::orchestrator::Orchestrator;
use querybench_engine::synthetic::{SyntheticFactory, SyntheticProfile};
use tokio::sync::broadcast;

fn config() -> RunConfig {
    RunConfig {
        statement: "SELECT 1".into(),
        workers: 2,
        warmup_seconds: 1,
        run_seconds: 2,
        scaling: ScalingConfig::Fixed {
            concurrent_connections: 4,
        },
        bounds: ScalingBounds {
            min_virtual_users: 1,
            max_virtual_users: 64,
        },
        pool: PoolSettings {
            size: 8,
            min_viable: 0,
            max_parallel_connect: 4,
            connect_timeout_seconds: 5,
            drain_grace_seconds: 2,
        },
        guardrails: GuardrailConfig::default(),
        slo: SloConfig::default(),
        supervision: SupervisionSettings::default(),
    }
}

async fn orchestrator(profile: SyntheticProfile) -> Orchestrator {
    let factory = Arc::new(SyntheticFactory::new(profile));
    Orchestrator::connect(factory).await.unwrap()
}

/// Drain every event currently reachable, returning the phase sequence and
/// asserting run-wide sequence numbers strictly increase.
fn drain_phases(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let seqs: Vec<u64> = events.iter().map(|e| e.seq()).collect();
    for pair in seqs.windows(2) {
        assert!(pair[0] < pair[1], "sequence regressed: {seqs:?}");
    }
    events
}

fn phases_of(events: &[RunEvent]) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|e| e.as_phase_changed())
        .map(|e| e.phase)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_emits_four_phase_events_in_order() {
    let orchestrator = orchestrator(SyntheticProfile::default()).await;
    let handle = orchestrator.start_run(config()).unwrap();
    let mut rx = handle.subscribe();

    let outcome = handle.wait().await.unwrap();
    assert!(outcome.succeeded());
    assert_eq!(outcome.final_phase, Phase::Completed);
    assert!(outcome.reason.is_none());
    assert!(outcome.total_ops > 0);
    assert!(outcome.latency.count > 0);

    let events = drain_phases(&mut rx);
    let phases = phases_of(&events);
    assert_eq!(
        phases,
        vec![
            Phase::Warmup,
            Phase::Running,
            Phase::Processing,
            Phase::Completed
        ]
    );

    // Warmup/run windows ride on their entry events
    let warmup = events
        .iter()
        .filter_map(|e| e.as_phase_changed())
        .find(|e| e.phase == Phase::Warmup)
        .unwrap();
    assert_eq!(warmup.warmup_seconds, Some(1));
    let running = events
        .iter()
        .filter_map(|e| e.as_phase_changed())
        .find(|e| e.phase == Phase::Running)
        .unwrap();
    assert_eq!(running.run_seconds, Some(2));

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_phase_history_tracks_full_lifecycle() {
    let orchestrator = orchestrator(SyntheticProfile::default()).await;
    let handle = orchestrator.start_run(config()).unwrap();
    let outcome = handle.wait().await.unwrap();

    let phases: Vec<Phase> = outcome.phase_history.iter().map(|(p, _)| *p).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Prepared,
            Phase::Initializing,
            Phase::Warmup,
            Phase::Running,
            Phase::Processing,
            Phase::Completed
        ]
    );
    // Entry timestamps never go backwards
    for pair in outcome.phase_history.windows(2) {
        assert!(pair[0].1 <= pair[1].1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_guardrail_breach_cancels_with_condition_in_reason() {
    let orchestrator = orchestrator(SyntheticProfile {
        // Every other query errors: a 50% error rate
        fail_every_nth_query: 2,
        ..SyntheticProfile::default()
    })
    .await;

    let mut cfg = config();
    cfg.warmup_seconds = 0;
    cfg.run_seconds = 30;
    cfg.guardrails.max_error_rate = Some(0.05);

    let handle = orchestrator.start_run(cfg).unwrap();
    let mut rx = handle.subscribe();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.final_phase, Phase::Cancelled);
    let reason = outcome.reason.unwrap();
    assert!(
        reason.contains("exceeded guardrail 0.0500"),
        "reason was: {reason}"
    );

    let phases = phases_of(&drain_phases(&mut rx));
    assert_eq!(
        phases,
        vec![
            Phase::Warmup,
            Phase::Running,
            Phase::Cancelling,
            Phase::Cancelled
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_user_cancel_during_running_drains_gracefully() {
    let orchestrator = orchestrator(SyntheticProfile::default()).await;
    let mut cfg = config();
    cfg.run_seconds = 600;

    let handle = orchestrator.start_run(cfg).unwrap();
    let mut rx = handle.subscribe();

    // Wait until the run is measuring, then cancel
    loop {
        let event = rx.recv().await.unwrap();
        if let Some(change) = event.as_phase_changed() {
            if change.phase == Phase::Running {
                break;
            }
        }
    }
    handle.cancel("maintenance window").await;
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.final_phase, Phase::Cancelled);
    assert_eq!(outcome.reason.as_deref(), Some("maintenance window"));

    let phases = phases_of(&drain_phases(&mut rx));
    assert_eq!(phases, vec![Phase::Cancelling, Phase::Cancelled]);
    let cancelling = outcome
        .phase_history
        .iter()
        .find(|(p, _)| *p == Phase::Cancelling);
    assert!(cancelling.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_worker_crash_mid_run_degrades_and_completes() {
    let orchestrator = orchestrator(SyntheticProfile::default()).await;
    let mut cfg = config();
    cfg.warmup_seconds = 0;
    cfg.run_seconds = 30;

    let handle = orchestrator.start_run(cfg).unwrap();
    let mut rx = handle.subscribe();

    // Crash one of the two workers once measurement is underway; its
    // heartbeats stop and the sweep marks it DEAD
    loop {
        let event = rx.recv().await.unwrap();
        if let Some(change) = event.as_phase_changed() {
            if change.phase == Phase::Running {
                break;
            }
        }
    }
    handle.inject_worker_crash(0).await;
    let outcome = handle.wait().await.unwrap();

    assert!(outcome.succeeded());
    assert_eq!(outcome.final_phase, Phase::Completed);
    assert!(outcome.total_ops > 0);
    assert!(!outcome
        .phase_history
        .iter()
        .any(|(p, _)| *p == Phase::Cancelling));

    // Snapshots after the DEAD marking report the lone survivor
    let events = drain_phases(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEvent::Metrics(m) if m.active_workers == 1)));
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_cancels_without_warmup() {
    // Control pool and preflight get the first four connects; every
    // benchmark connect hangs, so no worker ever reports WAITING
    let orchestrator = orchestrator(SyntheticProfile {
        stall_connects_after: 4,
        ..SyntheticProfile::default()
    })
    .await;

    let mut cfg = config();
    cfg.pool.connect_timeout_seconds = 600;
    cfg.supervision.readiness_timeout_seconds = 2;

    let handle = orchestrator.start_run(cfg).unwrap();
    let mut rx = handle.subscribe();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.final_phase, Phase::Cancelled);
    let reason = outcome.reason.unwrap();
    assert!(reason.contains("not ready within"), "reason: {reason}");
    assert_eq!(outcome.total_ops, 0);

    // The warmup timer never started and no WARMUP was announced
    let phases = phases_of(&drain_phases(&mut rx));
    assert_eq!(phases, vec![Phase::Cancelled]);
    let history: Vec<Phase> = outcome.phase_history.iter().map(|(p, _)| *p).collect();
    assert_eq!(
        history,
        vec![Phase::Prepared, Phase::Initializing, Phase::Cancelled]
    );
}

#[tokio::test(start_paused = true)]
async fn test_pool_init_failure_is_fatal_with_no_warmup() {
    // Control pool (4) and preflight succeed; every benchmark connect fails
    let orchestrator = orchestrator(SyntheticProfile {
        connect_budget: 4,
        ..SyntheticProfile::default()
    })
    .await;

    let handle = orchestrator.start_run(config()).unwrap();
    let mut rx = handle.subscribe();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.final_phase, Phase::Cancelled);
    let reason = outcome.reason.unwrap();
    assert!(reason.contains("failed during setup"), "reason: {reason}");
    assert_eq!(outcome.total_ops, 0);

    // No WARMUP was ever announced; subscribers see only the terminal event
    let phases = phases_of(&drain_phases(&mut rx));
    assert_eq!(phases, vec![Phase::Cancelled]);
}

#[tokio::test(start_paused = true)]
async fn test_partial_pool_above_minimum_degrades_and_completes() {
    // 4 control + 6 benchmark connects succeed, the last 2 fail; minimum
    // viable for a pool of 8 is 4
    let orchestrator = orchestrator(SyntheticProfile {
        connect_budget: 10,
        ..SyntheticProfile::default()
    })
    .await;

    let handle = orchestrator.start_run(config()).unwrap();
    let outcome = handle.wait().await.unwrap();
    assert!(outcome.succeeded());
    assert!(outcome.total_ops > 0);
}

#[tokio::test(start_paused = true)]
async fn test_find_max_stops_early_and_reports_ceiling() {
    let orchestrator = orchestrator(SyntheticProfile {
        // 2ms query latency will never meet a 0.5ms p95 SLO
        query_latency: Duration::from_millis(2),
        ..SyntheticProfile::default()
    })
    .await;

    let mut cfg = config();
    cfg.warmup_seconds = 0;
    cfg.run_seconds = 600;
    cfg.scaling = ScalingConfig::FindMax {
        start_concurrency: 2,
        concurrency_increment: 2,
        step_duration_seconds: 1,
    };
    cfg.slo.p95_latency_ms = Some(0.5);

    let handle = orchestrator.start_run(cfg).unwrap();
    let mut rx = handle.subscribe();
    let outcome = handle.wait().await.unwrap();

    // Early stop is still a successful run
    assert!(outcome.succeeded());
    assert_eq!(outcome.discovered_max, Some(1));
    let phases = phases_of(&drain_phases(&mut rx));
    assert_eq!(
        phases,
        vec![
            Phase::Warmup,
            Phase::Running,
            Phase::Processing,
            Phase::Completed
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_metrics_snapshots_flow_during_measurement() {
    let orchestrator = orchestrator(SyntheticProfile::default()).await;
    let mut cfg = config();
    cfg.warmup_seconds = 0;
    cfg.run_seconds = 5;

    let handle = orchestrator.start_run(cfg).unwrap();
    let mut rx = handle.subscribe();
    let outcome = handle.wait().await.unwrap();
    assert!(outcome.succeeded());

    let events = drain_phases(&mut rx);
    let snapshots: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Metrics(m) => Some(m),
            RunEvent::PhaseChanged(_) => None,
        })
        .collect();
    // One per second of measurement, give or take the final partial tick
    assert!(snapshots.len() >= 4, "got {} snapshots", snapshots.len());
    assert!(snapshots.iter().any(|m| m.total_ops > 0));
    assert!(snapshots.iter().all(|m| m.error_rate == 0.0));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_rejected_before_any_phase() {
    let orchestrator = orchestrator(SyntheticProfile::default()).await;
    let mut cfg = config();
    cfg.run_seconds = 0;
    assert!(orchestrator.start_run(cfg).is_err());
}
