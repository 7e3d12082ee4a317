//! Bounded-retry scheduling shared by capture completion polling and
//! channel reconnection.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Fast attempts first, then a slower cadence, all inside an overall bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub fast_interval: Duration,
    pub fast_attempts: u32,
    pub slow_interval: Duration,
    pub timeout: Duration,
}

impl RetrySchedule {
    /// Delay before attempt `attempt` (zero-based) is retried
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt < self.fast_attempts {
            self.fast_interval
        } else {
            self.slow_interval
        }
    }
}

/// Terminal result of a bounded retry run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Completed { value: T, attempts: u32 },
    TimedOut { attempts: u32, elapsed: Duration },
}

/// Run `probe` on the schedule until it yields a value or the bound expires.
///
/// `Ok(None)` means "not yet"; errors are logged and count as an attempt.
/// The probe is never called after the timeout has elapsed.
pub async fn poll_until<T, E, F, Fut>(schedule: RetrySchedule, mut probe: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        match probe(attempt).await {
            Ok(Some(value)) => {
                debug!("Probe completed after {} attempts", attempt + 1);
                return RetryOutcome::Completed {
                    value,
                    attempts: attempt + 1,
                };
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Probe attempt {} failed: {}", attempt + 1, e);
            }
        }

        let delay = schedule.delay_after(attempt);
        attempt += 1;

        let elapsed = started.elapsed();
        if elapsed + delay > schedule.timeout {
            return RetryOutcome::TimedOut {
                attempts: attempt,
                elapsed,
            };
        }

        sleep(delay).await;
    }
}

/// Exponential reconnection backoff with a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt; grows with each call
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
