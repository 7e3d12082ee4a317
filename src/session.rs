//! Live-view session ownership by heartbeat recency.
//!
//! There is no lock: each viewer writes `"<timestamp>:<sessionId>"` into the
//! shared session slot and yields as soon as it reads a different, fresh and
//! newer heartbeat. Heartbeats older than the stale window are abandoned and
//! may be overwritten without contest.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{age, Millis};
use crate::store::SessionStamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSession {
    pub session_id: String,
    pub started_at: Millis,
    pub last_heartbeat_at: Millis,
}

impl CameraSession {
    pub fn stamp(&self) -> SessionStamp {
        SessionStamp {
            timestamp_ms: self.last_heartbeat_at,
            session_id: self.session_id.clone(),
        }
    }
}

/// Outcome of comparing the shared slot against our own session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionVerdict {
    /// We hold no session
    Inactive,
    /// Slot is empty; ours to claim
    Vacant,
    /// Slot carries our own heartbeat
    Owned,
    /// Slot carries someone else's heartbeat past the stale window
    Abandoned { previous: SessionStamp },
    /// Foreign heartbeat that is fresh but older than ours (lost write)
    Outdated { previous: SessionStamp },
    /// A fresh, newer foreign heartbeat: we must yield
    Conceded { winner: SessionStamp },
}

impl SessionVerdict {
    pub fn must_concede(&self) -> bool {
        matches!(self, SessionVerdict::Conceded { .. })
    }
}

/// Unique with overwhelming probability: timestamp plus a random suffix
pub fn mint_session_id(now: Millis) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now, &suffix[..8])
}

#[derive(Debug, Clone)]
pub struct SessionManager {
    heartbeat_interval: Duration,
    stale_after: Duration,
    current: Option<CameraSession>,
}

impl SessionManager {
    pub fn new(heartbeat_interval: Duration, stale_after: Duration) -> Self {
        Self {
            heartbeat_interval,
            stale_after,
            current: None,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn current(&self) -> Option<&CameraSession> {
        self.current.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.session_id.as_str())
    }

    /// Mint a new session and return the first heartbeat to write
    pub fn start(&mut self, now: Millis) -> SessionStamp {
        self.start_with_id(mint_session_id(now), now)
    }

    pub fn start_with_id(&mut self, session_id: String, now: Millis) -> SessionStamp {
        let session = CameraSession {
            session_id,
            started_at: now,
            last_heartbeat_at: now,
        };
        info!("Started live session {}", session.session_id);
        let stamp = session.stamp();
        self.current = Some(session);
        stamp
    }

    /// Drop the session (turned off, superseded or closed)
    pub fn end(&mut self) -> Option<CameraSession> {
        let ended = self.current.take();
        if let Some(session) = &ended {
            info!("Ended live session {}", session.session_id);
        }
        ended
    }

    /// Advance the heartbeat clock and return the stamp to write
    pub fn heartbeat(&mut self, now: Millis) -> Option<SessionStamp> {
        let session = self.current.as_mut()?;
        session.last_heartbeat_at = now;
        debug!("Heartbeat for session {} at {}", session.session_id, now);
        Some(session.stamp())
    }

    /// Compare the shared slot with our session.
    ///
    /// Ties on timestamp are broken by session id so two simultaneous
    /// starters cannot both yield.
    pub fn evaluate(&self, slot: Option<&SessionStamp>, now: Millis) -> SessionVerdict {
        let Some(own) = self.current.as_ref() else {
            return SessionVerdict::Inactive;
        };
        let Some(slot) = slot else {
            return SessionVerdict::Vacant;
        };

        if slot.session_id == own.session_id {
            return SessionVerdict::Owned;
        }

        if age(now, slot.timestamp_ms) >= self.stale_after {
            return SessionVerdict::Abandoned {
                previous: slot.clone(),
            };
        }

        let theirs = (slot.timestamp_ms, slot.session_id.as_str());
        let ours = (own.last_heartbeat_at, own.session_id.as_str());
        if theirs > ours {
            SessionVerdict::Conceded {
                winner: slot.clone(),
            }
        } else {
            SessionVerdict::Outdated {
                previous: slot.clone(),
            }
        }
    }
}
