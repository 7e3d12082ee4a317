use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CaptureOutcome, CaptureTicket, ChannelMode, Reply, SharedTransport, Transport};
use crate::clock::{Millis, SharedClock};
use crate::error::TransportError;
use crate::events::{Command, StatusSnapshot};
use crate::retry::Backoff;

/// Decides when the event channel may be (re)attempted.
///
/// Every failed connection attempt counts. Reaching the threshold parks the
/// client on polling for the cooldown, after which the event channel is
/// tried again; a single success clears the count.
#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    threshold: u32,
    cooldown: Duration,
    backoff: Backoff,
    consecutive_failures: u32,
    mode: ChannelMode,
    fallback_until: Option<Millis>,
    next_attempt_at: Millis,
}

impl FailoverPolicy {
    pub fn new(threshold: u32, cooldown: Duration, backoff: Backoff) -> Self {
        Self {
            threshold,
            cooldown,
            backoff,
            consecutive_failures: 0,
            mode: ChannelMode::Event,
            fallback_until: None,
            next_attempt_at: 0,
        }
    }

    /// Preferred channel: `Polling` only while parked after repeated failures
    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether an event-channel connection attempt is due at `now`
    pub fn should_attempt(&mut self, now: Millis) -> bool {
        match self.mode {
            ChannelMode::Polling => match self.fallback_until {
                Some(until) if now < until => false,
                _ => {
                    info!("Polling cooldown over, retrying event channel");
                    self.mode = ChannelMode::Event;
                    self.fallback_until = None;
                    true
                }
            },
            ChannelMode::Event => now >= self.next_attempt_at,
        }
    }

    /// Count a failed attempt. Returns `true` when this failure parks the
    /// client on polling.
    pub fn record_failure(&mut self, now: Millis) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= self.threshold {
            self.mode = ChannelMode::Polling;
            self.fallback_until = Some(now + self.cooldown.as_millis() as Millis);
            return true;
        }

        let delay = self.backoff.next_delay();
        self.next_attempt_at = now + delay.as_millis() as Millis;
        debug!(
            "Event channel failure {} of {}, next attempt in {:?}",
            self.consecutive_failures, self.threshold, delay
        );
        false
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.backoff.reset();
        self.mode = ChannelMode::Event;
        self.fallback_until = None;
        self.next_attempt_at = 0;
    }
}

/// Serves every request over the event channel while it is up and over
/// polling otherwise. Callers cannot tell which one answered.
pub struct FailoverTransport {
    event: SharedTransport,
    polling: SharedTransport,
    policy: Mutex<FailoverPolicy>,
    connecting: tokio::sync::Mutex<()>,
    clock: SharedClock,
}

impl FailoverTransport {
    pub fn new(
        event: SharedTransport,
        polling: SharedTransport,
        policy: FailoverPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            event,
            polling,
            policy: Mutex::new(policy),
            connecting: tokio::sync::Mutex::new(()),
            clock,
        }
    }

    pub fn policy(&self) -> FailoverPolicy {
        self.policy.lock().clone()
    }

    /// Attempt the event channel if it is down and an attempt is due
    pub async fn maintain(&self) {
        if self.event.is_connected() {
            return;
        }
        // Another request is already connecting; this one goes over polling
        let Ok(_guard) = self.connecting.try_lock() else {
            return;
        };
        if !self.policy.lock().should_attempt(self.clock.now_ms()) {
            return;
        }

        match self.event.connect().await {
            Ok(()) => {
                let mut policy = self.policy.lock();
                if policy.consecutive_failures() > 0 {
                    info!(
                        "Event channel restored after {} failures",
                        policy.consecutive_failures()
                    );
                }
                policy.record_success();
            }
            Err(e) => {
                warn!("Event channel connection failed: {}", e);
                let mut policy = self.policy.lock();
                if policy.record_failure(self.clock.now_ms()) {
                    warn!(
                        "{} consecutive event channel failures, using polling for {:?}",
                        policy.consecutive_failures(),
                        policy.cooldown
                    );
                }
            }
        }
    }

    async fn drop_event_channel(&self, error: &TransportError) {
        if matches!(
            error,
            TransportError::Disconnected | TransportError::Timeout { .. }
        ) {
            warn!("Event channel lost: {}", error);
            self.event.disconnect().await;
        }
    }
}

#[async_trait]
impl Transport for FailoverTransport {
    fn mode(&self) -> ChannelMode {
        if self.event.is_connected() {
            ChannelMode::Event
        } else {
            ChannelMode::Polling
        }
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.maintain().await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.event.disconnect().await;
    }

    async fn send(&self, command: Command) -> Result<Reply, TransportError> {
        self.maintain().await;

        if self.event.is_connected() {
            match self.event.send(command.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    self.drop_event_channel(&e).await;
                    // The hub may already have started it
                    if matches!(command, Command::Capture) {
                        return Err(e);
                    }
                    debug!("Resending {} over polling", command.name());
                }
            }
        }

        self.polling.send(command).await
    }

    async fn status(&self) -> Result<StatusSnapshot, TransportError> {
        self.maintain().await;

        if self.event.is_connected() {
            match self.event.status().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    debug!("Event status unavailable ({}), reading slots", e);
                    self.drop_event_channel(&e).await;
                }
            }
        }

        self.polling.status().await
    }

    async fn await_capture(&self, ticket: &CaptureTicket) -> Result<CaptureOutcome, TransportError> {
        if ticket.via == ChannelMode::Event {
            match self.event.await_capture(ticket).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(
                        "Event channel lost while waiting for capture {} ({}), polling for the result",
                        ticket.id, e
                    );
                }
            }
        }

        self.polling.await_capture(ticket).await
    }

    async fn latest_frame(&self) -> Result<Option<u64>, TransportError> {
        if self.event.is_connected() {
            match self.event.latest_frame().await {
                Ok(frame) => return Ok(frame),
                Err(e) => self.drop_event_channel(&e).await,
            }
        }

        self.polling.latest_frame().await
    }
}
