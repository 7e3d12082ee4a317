//! Wall-clock source used for heartbeats, request timestamps and staleness.
//!
//! All protocol timestamps are milliseconds since the Unix epoch so they can be
//! compared across independent clients.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub type Millis = u64;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Millis;
}

/// Real system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        Utc::now().timestamp_millis().max(0) as Millis
    }
}

/// Clock that follows the tokio timer, so paused-time tests and the protocol
/// timestamps advance together.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base_ms: Millis,
    base_instant: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(base_ms: Millis) -> Self {
        Self {
            base_ms,
            base_instant: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> Millis {
        self.base_ms + self.base_instant.elapsed().as_millis() as Millis
    }
}

/// Manually driven clock for deterministic tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Millis>>,
}

impl ManualClock {
    pub fn new(start_ms: Millis) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_ms)),
        }
    }

    pub fn set(&self, now_ms: Millis) {
        *self.now.lock() = now_ms;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_millis() as Millis;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        *self.now.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Elapsed time between two stamps, saturating at zero for stamps from the future
pub fn age(now_ms: Millis, then_ms: Millis) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(then_ms))
}
