//! Load-scaling strategies
//!
//! A strategy is consulted on every adjustment tick with the elapsed
//! measurement time and the rolling sample window, and answers with a
//! target virtual-user count. Strategies are pure state machines: given the
//! same sample sequence and the same internal cursor they always produce
//! the same decisions, which is what makes runs reproducible.

use std::time::Duration;

use querybench_common::{PerfSample, RunConfig, SampleWindow, ScalingBounds, ScalingConfig, SloConfig};

/// Outcome of one adjustment tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Keep the current target
    Hold,
    /// Move to a new target (already clamped to bounds)
    Adjust(u32),
    /// Find-Max hit its ceiling; the run can stop measuring early
    StopEarly { max_sustainable: u32 },
}

pub trait ScalingStrategy: Send + Sync {
    /// Target to apply when RUNNING begins
    fn initial_target(&self) -> u32;

    /// Consulted once per adjustment interval during RUNNING
    fn next_target(&mut self, elapsed: Duration, window: &SampleWindow) -> Decision;

    fn name(&self) -> &'static str;
}

fn clamp(bounds: &ScalingBounds, value: u32) -> u32 {
    value.clamp(bounds.min_virtual_users, bounds.max_virtual_users)
}

/// Build the strategy for a run configuration
pub fn strategy_for(config: &RunConfig) -> Box<dyn ScalingStrategy> {
    match &config.scaling {
        ScalingConfig::Fixed {
            concurrent_connections,
        } => Box::new(FixedStrategy {
            target: clamp(&config.bounds, *concurrent_connections),
        }),
        ScalingConfig::Qps {
            target_qps,
            step,
            hysteresis,
        } => Box::new(QpsSeekingStrategy {
            target_qps: *target_qps,
            step: *step,
            hysteresis: *hysteresis,
            bounds: config.bounds,
            current: clamp(&config.bounds, config.bounds.min_virtual_users),
        }),
        ScalingConfig::FindMax {
            start_concurrency,
            concurrency_increment,
            step_duration_seconds,
        } => Box::new(FindMaxStrategy {
            increment: *concurrency_increment,
            step_duration: Duration::from_secs(*step_duration_seconds),
            slo: config.slo,
            bounds: config.bounds,
            current: clamp(&config.bounds, *start_concurrency),
            last_compliant: None,
            step_started: Duration::ZERO,
        }),
    }
}

/// Constant concurrency for the whole measurement window
struct FixedStrategy {
    target: u32,
}

impl ScalingStrategy for FixedStrategy {
    fn initial_target(&self) -> u32 {
        self.target
    }

    fn next_target(&mut self, _elapsed: Duration, _window: &SampleWindow) -> Decision {
        Decision::Hold
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Steps concurrency toward a target throughput, holding inside a
/// hysteresis band to avoid oscillation.
struct QpsSeekingStrategy {
    target_qps: f64,
    step: u32,
    hysteresis: f64,
    bounds: ScalingBounds,
    current: u32,
}

impl ScalingStrategy for QpsSeekingStrategy {
    fn initial_target(&self) -> u32 {
        self.current
    }

    fn next_target(&mut self, _elapsed: Duration, window: &SampleWindow) -> Decision {
        if window.is_empty() {
            return Decision::Hold;
        }
        let observed = window.mean_ops_per_sec();
        let band = self.target_qps * self.hysteresis;
        if (observed - self.target_qps).abs() <= band {
            return Decision::Hold;
        }
        let next = if observed < self.target_qps {
            clamp(&self.bounds, self.current.saturating_add(self.step))
        } else {
            clamp(&self.bounds, self.current.saturating_sub(self.step))
        };
        if next == self.current {
            return Decision::Hold;
        }
        self.current = next;
        Decision::Adjust(next)
    }

    fn name(&self) -> &'static str {
        "qps"
    }
}

/// Climbs a concurrency ladder by a fixed increment per step duration,
/// holding each rung until the SLO breaks. The last rung that completed a
/// full step without a breach is the discovered maximum.
struct FindMaxStrategy {
    increment: u32,
    step_duration: Duration,
    slo: SloConfig,
    bounds: ScalingBounds,
    current: u32,
    last_compliant: Option<u32>,
    step_started: Duration,
}

/// Description of the violated threshold, None while the SLO holds
pub fn slo_breach(slo: &SloConfig, sample: &PerfSample) -> Option<String> {
    if let Some(max_p95) = slo.p95_latency_ms {
        if sample.p95_latency_ms > max_p95 {
            return Some(format!(
                "p95 latency {:.1}ms exceeded SLO {max_p95:.1}ms",
                sample.p95_latency_ms
            ));
        }
    }
    if let Some(max_err) = slo.max_error_rate {
        if sample.error_rate > max_err {
            return Some(format!(
                "error rate {:.4} exceeded SLO {max_err:.4}",
                sample.error_rate
            ));
        }
    }
    None
}

impl ScalingStrategy for FindMaxStrategy {
    fn initial_target(&self) -> u32 {
        self.current
    }

    fn next_target(&mut self, elapsed: Duration, window: &SampleWindow) -> Decision {
        if let Some(sample) = window.latest() {
            if slo_breach(&self.slo, sample).is_some() {
                return Decision::StopEarly {
                    max_sustainable: self.last_compliant.unwrap_or(self.bounds.min_virtual_users),
                };
            }
        }

        if elapsed.saturating_sub(self.step_started) < self.step_duration {
            return Decision::Hold;
        }

        // Rung survived its full step
        self.last_compliant = Some(self.current);
        let next = clamp(&self.bounds, self.current.saturating_add(self.increment));
        self.step_started = elapsed;
        if next == self.current {
            // Already at max_virtual_users; nothing left to probe
            return Decision::StopEarly {
                max_sustainable: self.current,
            };
        }
        self.current = next;
        Decision::Adjust(next)
    }

    fn name(&self) -> &'static str {
        "find-max"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querybench_common::{PoolSettings, GuardrailConfig, SupervisionSettings};

    fn config_with(scaling: ScalingConfig, slo: SloConfig) -> RunConfig {
        RunConfig {
            statement: "SELECT 1".into(),
            workers: 1,
            warmup_seconds: 0,
            run_seconds: 60,
            scaling,
            bounds: ScalingBounds {
                min_virtual_users: 1,
                max_virtual_users: 100,
            },
            pool: PoolSettings::default(),
            guardrails: GuardrailConfig::default(),
            slo,
            supervision: SupervisionSettings::default(),
        }
    }

    fn sample(ops: f64, p95: f64, err: f64) -> PerfSample {
        PerfSample {
            ops_per_sec: ops,
            p95_latency_ms: p95,
            error_rate: err,
        }
    }

    #[test]
    fn test_fixed_holds_forever() {
        let config = config_with(
            ScalingConfig::Fixed {
                concurrent_connections: 150,
            },
            SloConfig::default(),
        );
        let mut strategy = strategy_for(&config);
        // Clamped into bounds
        assert_eq!(strategy.initial_target(), 100);
        let mut window = SampleWindow::new(4);
        window.push(sample(10.0, 5.0, 0.0));
        for i in 0..10 {
            assert_eq!(
                strategy.next_target(Duration::from_secs(i), &window),
                Decision::Hold
            );
        }
    }

    #[test]
    fn test_qps_steps_toward_target() {
        let config = config_with(
            ScalingConfig::Qps {
                target_qps: 100.0,
                step: 5,
                hysteresis: 0.05,
            },
            SloConfig::default(),
        );
        let mut strategy = strategy_for(&config);
        assert_eq!(strategy.initial_target(), 1);

        let mut window = SampleWindow::new(1);
        window.push(sample(40.0, 5.0, 0.0));
        assert_eq!(
            strategy.next_target(Duration::from_secs(1), &window),
            Decision::Adjust(6)
        );

        // Inside the band: hold
        window.push(sample(97.0, 5.0, 0.0));
        assert_eq!(
            strategy.next_target(Duration::from_secs(2), &window),
            Decision::Hold
        );

        // Overshoot: step back down
        window.push(sample(130.0, 5.0, 0.0));
        assert_eq!(
            strategy.next_target(Duration::from_secs(3), &window),
            Decision::Adjust(1)
        );
    }

    #[test]
    fn test_qps_holds_on_empty_window() {
        let config = config_with(
            ScalingConfig::Qps {
                target_qps: 100.0,
                step: 5,
                hysteresis: 0.05,
            },
            SloConfig::default(),
        );
        let mut strategy = strategy_for(&config);
        let window = SampleWindow::new(4);
        assert_eq!(
            strategy.next_target(Duration::from_secs(1), &window),
            Decision::Hold
        );
    }

    #[test]
    fn test_find_max_climbs_ladder() {
        let config = config_with(
            ScalingConfig::FindMax {
                start_concurrency: 10,
                concurrency_increment: 10,
                step_duration_seconds: 5,
            },
            SloConfig {
                p95_latency_ms: Some(50.0),
                max_error_rate: None,
            },
        );
        let mut strategy = strategy_for(&config);
        assert_eq!(strategy.initial_target(), 10);

        let mut window = SampleWindow::new(4);
        window.push(sample(100.0, 10.0, 0.0));

        // Mid-step: hold
        assert_eq!(
            strategy.next_target(Duration::from_secs(3), &window),
            Decision::Hold
        );
        // Step complete: climb
        assert_eq!(
            strategy.next_target(Duration::from_secs(5), &window),
            Decision::Adjust(20)
        );
        assert_eq!(
            strategy.next_target(Duration::from_secs(10), &window),
            Decision::Adjust(30)
        );

        // SLO breach: stop, reporting the last rung that survived a step
        window.push(sample(100.0, 80.0, 0.0));
        assert_eq!(
            strategy.next_target(Duration::from_secs(12), &window),
            Decision::StopEarly {
                max_sustainable: 20
            }
        );
    }

    #[test]
    fn test_find_max_breach_before_first_step_reports_floor() {
        let config = config_with(
            ScalingConfig::FindMax {
                start_concurrency: 10,
                concurrency_increment: 10,
                step_duration_seconds: 5,
            },
            SloConfig {
                p95_latency_ms: None,
                max_error_rate: Some(0.01),
            },
        );
        let mut strategy = strategy_for(&config);
        let mut window = SampleWindow::new(4);
        window.push(sample(100.0, 10.0, 0.5));
        assert_eq!(
            strategy.next_target(Duration::from_secs(1), &window),
            Decision::StopEarly { max_sustainable: 1 }
        );
    }

    #[test]
    fn test_find_max_stops_at_upper_bound() {
        let config = config_with(
            ScalingConfig::FindMax {
                start_concurrency: 95,
                concurrency_increment: 10,
                step_duration_seconds: 5,
            },
            SloConfig {
                p95_latency_ms: Some(1000.0),
                max_error_rate: None,
            },
        );
        let mut strategy = strategy_for(&config);
        let mut window = SampleWindow::new(4);
        window.push(sample(100.0, 10.0, 0.0));

        assert_eq!(
            strategy.next_target(Duration::from_secs(5), &window),
            Decision::Adjust(100)
        );
        assert_eq!(
            strategy.next_target(Duration::from_secs(10), &window),
            Decision::StopEarly {
                max_sustainable: 100
            }
        );
    }

    #[test]
    fn test_determinism_same_inputs_same_decisions() {
        let config = config_with(
            ScalingConfig::Qps {
                target_qps: 200.0,
                step: 8,
                hysteresis: 0.1,
            },
            SloConfig::default(),
        );
        let run = |samples: &[PerfSample]| -> Vec<Decision> {
            let mut strategy = strategy_for(&config);
            let mut window = SampleWindow::new(8);
            samples
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    window.push(*s);
                    strategy.next_target(Duration::from_secs(i as u64), &window)
                })
                .collect()
        };
        let samples: Vec<PerfSample> = (0..20)
            .map(|i| sample(20.0 * i as f64, 5.0, 0.0))
            .collect();
        assert_eq!(run(&samples), run(&samples));
    }
}
