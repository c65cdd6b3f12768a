//! Bounded condition waiting with exponential backoff and cancellation.
//!
//! Used for target preflight (is the database reachable before we build a
//! benchmark pool against it) and anywhere else the engine polls an async
//! condition with a deadline.

use anyhow::Result;
use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff and deadline parameters for [`wait_until`]
#[derive(Debug, Clone)]
pub struct WaitConfig {
    pub initial_delay: Duration,
    /// Cap for exponential growth
    pub max_delay: Duration,
    /// Total time budget before giving up
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Poll `check` until it returns `Ok(true)`, backing off exponentially.
///
/// Fails on timeout, cancellation, or the first `Err` from `check`.
pub async fn wait_until<F, Fut>(
    config: WaitConfig,
    cancel: &CancellationToken,
    check: F,
    what: &str,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = tokio::time::Instant::now();
    let mut attempts = 0u32;

    let mut delays = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_factor(2.0)
        .with_jitter()
        .build();

    loop {
        attempts += 1;

        if cancel.is_cancelled() {
            anyhow::bail!("wait for {what} cancelled");
        }
        if start.elapsed() >= config.timeout {
            anyhow::bail!(
                "timed out waiting for {what} after {:?} ({attempts} attempts)",
                config.timeout
            );
        }

        match check().await {
            Ok(true) => {
                debug!(what, attempts, "condition satisfied");
                return Ok(());
            }
            Ok(false) => {
                let delay = delays.next().unwrap_or(config.max_delay);
                debug!(what, attempt = attempts, delay_ms = delay.as_millis(), "not ready, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        anyhow::bail!("wait for {what} cancelled");
                    }
                }
            }
            Err(e) => {
                warn!(what, error = ?e, "condition check failed");
                return Err(e);
            }
        }
    }
}
