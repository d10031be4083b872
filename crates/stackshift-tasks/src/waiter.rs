//! Polling waiter: block a flow until a cloud condition holds.
//!
//! Each wait evaluates its probe, returns as soon as the condition is
//! met, and otherwise sleeps for the shared poll interval. The budget is
//! a wall-clock timeout chosen by the caller per wait kind.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Outcome of a wait that did not reach its condition.
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// The condition never held within the budget.
    #[error("timed out after {:.1} minutes waiting for {what}", .elapsed.as_secs_f64() / 60.0)]
    Timeout { what: String, elapsed: Duration },

    /// The probe itself failed; the wait was abandoned.
    #[error(transparent)]
    Probe(E),
}

impl<E> WaitError<E> {
    /// Elapsed wall-clock minutes, for timeouts.
    pub fn elapsed_minutes(&self) -> Option<f64> {
        match self {
            WaitError::Timeout { elapsed, .. } => Some(elapsed.as_secs_f64() / 60.0),
            WaitError::Probe(_) => None,
        }
    }
}

/// Polls probes at a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct PollingWaiter {
    poll_interval: Duration,
}

impl PollingWaiter {
    /// Create a waiter that sleeps `poll_interval` between probes.
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// The interval between probes.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Evaluate `probe` until `is_satisfied` accepts its value.
    ///
    /// Returns the satisfying value. Fails with `WaitError::Timeout` only
    /// once at least `timeout` has elapsed since the first probe.
    pub async fn wait_until<T, E, F, Fut, P>(
        &self,
        what: &str,
        timeout: Duration,
        mut probe: F,
        is_satisfied: P,
    ) -> Result<T, WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&T) -> bool,
    {
        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            let value = probe().await.map_err(WaitError::Probe)?;
            polls += 1;

            if is_satisfied(&value) {
                debug!(%what, polls, elapsed_secs = started.elapsed().as_secs(), "condition met");
                return Ok(value);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(WaitError::Timeout {
                    what: what.to_string(),
                    elapsed,
                });
            }

            debug!(%what, polls, elapsed_secs = elapsed.as_secs(), "condition not met yet");
            sleep(self.poll_interval).await;
        }
    }
}
