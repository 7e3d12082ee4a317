//! Online/offline derivation from telemetry staleness.
//!
//! Nothing here is persisted: the status is recomputed from the telemetry
//! slot's modification time on every observation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{age, Millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    /// No observation made yet
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessChange {
    WentOnline,
    WentOffline,
}

/// `(now - written_at) <= threshold`
pub fn derive_online(written_at: Option<Millis>, now: Millis, threshold: Duration) -> bool {
    match written_at {
        Some(written_at) => age(now, written_at) <= threshold,
        None => false,
    }
}

/// Tracks derived status across observations and reports transitions
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    threshold: Duration,
    status: OnlineStatus,
    last_seen_write: Option<Millis>,
    /// Local time a new but already-stale-looking write was seen
    skewed_write_seen_at: Option<Millis>,
}

impl LivenessMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            status: OnlineStatus::Unknown,
            last_seen_write: None,
            skewed_write_seen_at: None,
        }
    }

    pub fn status(&self) -> OnlineStatus {
        self.status
    }

    pub fn is_online(&self) -> bool {
        self.status == OnlineStatus::Online
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Feed the current telemetry write time.
    ///
    /// Offline is entered only once staleness exceeds the threshold. A newly
    /// observed write whose stamp already looks stale (writer clock skew)
    /// keeps the camera online for one threshold of local time; the very
    /// first observation never gets that allowance.
    pub fn observe(&mut self, written_at: Option<Millis>, now: Millis) -> Option<LivenessChange> {
        let stamp_fresh = derive_online(written_at, now, self.threshold);
        let is_new_write = match (written_at, self.last_seen_write) {
            (Some(written), Some(previous)) => written > previous,
            _ => false,
        };
        if is_new_write {
            self.skewed_write_seen_at = if stamp_fresh { None } else { Some(now) };
        }
        if written_at.is_some() && written_at > self.last_seen_write {
            self.last_seen_write = written_at;
        }

        let recently_seen = self
            .skewed_write_seen_at
            .map_or(false, |seen| age(now, seen) <= self.threshold);
        let next = if stamp_fresh || recently_seen {
            OnlineStatus::Online
        } else {
            OnlineStatus::Offline
        };

        let previous = std::mem::replace(&mut self.status, next);
        match (previous, next) {
            (OnlineStatus::Online, OnlineStatus::Offline) => {
                warn!(
                    "Camera telemetry stale (written at {:?}, now {}), marking offline",
                    written_at, now
                );
                Some(LivenessChange::WentOffline)
            }
            (OnlineStatus::Unknown, OnlineStatus::Offline) => {
                info!("No fresh camera telemetry, starting offline");
                Some(LivenessChange::WentOffline)
            }
            (OnlineStatus::Offline | OnlineStatus::Unknown, OnlineStatus::Online) => {
                info!("Fresh camera telemetry received, marking online");
                Some(LivenessChange::WentOnline)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(7);

    #[test]
    fn test_derive_online_boundary() {
        assert!(derive_online(Some(1_000), 8_000, THRESHOLD));
        assert!(!derive_online(Some(1_000), 8_001, THRESHOLD));
        assert!(!derive_online(None, 8_000, THRESHOLD));
    }

    #[test]
    fn test_goes_offline_only_after_threshold() {
        let mut monitor = LivenessMonitor::new(THRESHOLD);

        assert_eq!(
            monitor.observe(Some(1_000), 1_000),
            Some(LivenessChange::WentOnline)
        );
        assert_eq!(monitor.observe(Some(1_000), 4_000), None);
        assert_eq!(monitor.observe(Some(1_000), 8_000), None);
        assert!(monitor.is_online());

        assert_eq!(
            monitor.observe(Some(1_000), 8_001),
            Some(LivenessChange::WentOffline)
        );
        assert_eq!(monitor.status(), OnlineStatus::Offline);
    }

    #[test]
    fn test_recovers_only_on_new_write() {
        let mut monitor = LivenessMonitor::new(THRESHOLD);
        monitor.observe(Some(1_000), 1_000);
        monitor.observe(Some(1_000), 20_000);
        assert!(!monitor.is_online());

        // Same stale write observed again: stays offline
        assert_eq!(monitor.observe(Some(1_000), 21_000), None);

        // A new write whose stamp is old relative to our clock still counts
        assert_eq!(
            monitor.observe(Some(5_000), 21_000),
            Some(LivenessChange::WentOnline)
        );
        // and is not dropped on the next poll of the same write
        assert_eq!(monitor.observe(Some(5_000), 23_000), None);
        assert_eq!(
            monitor.observe(Some(5_000), 28_001),
            Some(LivenessChange::WentOffline)
        );
    }

    #[test]
    fn test_initial_stale_telemetry_starts_offline() {
        let mut monitor = LivenessMonitor::new(THRESHOLD);
        assert_eq!(
            monitor.observe(Some(1_000), 60_000),
            Some(LivenessChange::WentOffline)
        );

        let mut empty = LivenessMonitor::new(THRESHOLD);
        assert_eq!(empty.observe(None, 60_000), Some(LivenessChange::WentOffline));
        assert_eq!(empty.observe(None, 62_000), None);
    }
}
