//! Camera-side counterpart of the protocol.
//!
//! The hub owns the actuator. It accepts commands from both channels, allows
//! a single capture at a time, records results in the shared store and
//! periodically broadcasts status derived from the telemetry slot.

mod actuator;
#[cfg(test)]
mod tests;

pub use actuator::{CameraActuator, CaptureJob, ProcessActuator, SimulatedActuator};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Millis, SharedClock};
use crate::config::CamlinkConfig;
use crate::error::{StoreError, TransportError};
use crate::events::{CameraEvent, Command, EventBus, LiveAction, RejectReason, StatusSnapshot};
use crate::liveness::{derive_online, LivenessChange, LivenessMonitor};
use crate::store::{
    CameraTelemetry, CaptureResultRecord, FrameStamp, LiveEnabled, RawSlot, SessionStamp,
    SharedStore, Slot, SlotSchema, StateStoreExt, StreamQuality,
};
use crate::transport::{CaptureTicket, ChannelMode, PollingBackend, Reply};

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub offline_threshold: Duration,
    pub actuator_timeout: Duration,
    pub status_interval: Duration,
}

impl From<&CamlinkConfig> for HubSettings {
    fn from(config: &CamlinkConfig) -> Self {
        Self {
            offline_threshold: config.liveness.offline_threshold(),
            actuator_timeout: config.capture.actuator_timeout(),
            status_interval: config.server.status_interval(),
        }
    }
}

pub struct CameraHub {
    store: SharedStore,
    actuator: Arc<dyn CameraActuator>,
    bus: EventBus,
    clock: SharedClock,
    settings: HubSettings,
    in_flight: Mutex<Option<CaptureJob>>,
    capture_seq: AtomicU64,
    liveness: Mutex<LivenessMonitor>,
    last_frame: Mutex<Option<u64>>,
    cancellation_token: CancellationToken,
}

impl CameraHub {
    pub fn new(
        store: SharedStore,
        actuator: Arc<dyn CameraActuator>,
        clock: SharedClock,
        settings: HubSettings,
    ) -> Arc<Self> {
        info!("Camera hub using {} actuator", actuator.name());
        Arc::new(Self {
            store,
            actuator,
            bus: EventBus::default(),
            clock,
            liveness: Mutex::new(LivenessMonitor::new(settings.offline_threshold)),
            settings,
            in_flight: Mutex::new(None),
            capture_seq: AtomicU64::new(0),
            last_frame: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_capturing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Apply one command and produce the reply for its sender
    pub async fn execute(self: &Arc<Self>, command: Command) -> Reply {
        debug!("Hub executing {}", command.name());
        match command {
            Command::Capture => self.start_capture(),
            Command::LiveControl {
                action: LiveAction::Start,
            } => {
                let capturing = self.in_flight.lock().as_ref().map(|job| job.id.clone());
                if let Some(id) = capturing {
                    info!("Refusing to start live view during capture {}", id);
                    return busy(format!("capture {} in progress", id));
                }
                self.store_reply(self.store.save(&LiveEnabled(true)).await)
            }
            Command::LiveControl {
                action: LiveAction::Stop,
            } => self.store_reply(self.store.save(&LiveEnabled(false)).await),
            Command::SettingsUpdate { quality } => {
                self.store_reply(self.store.save(&quality).await)
            }
            Command::Heartbeat { session } => self.store_reply(self.store.save(&session).await),
            // Frame pushing is per connection and handled by the server
            Command::FrameFeed { .. } => Reply::Accepted,
        }
    }

    /// Slot write arriving over the polling API, validated by the slot schema
    pub async fn write_slot_value(self: &Arc<Self>, slot: Slot, value: &str) -> Reply {
        if !slot.client_writable() {
            return Reply::Rejected {
                reason: RejectReason::Invalid,
                details: Some(format!("slot '{}' is read-only", slot)),
            };
        }

        let command = match slot {
            Slot::LiveEnabled => LiveEnabled::parse(value).map(|live| Command::LiveControl {
                action: if live.0 {
                    LiveAction::Start
                } else {
                    LiveAction::Stop
                },
            }),
            Slot::LiveQuality => {
                StreamQuality::parse(value).map(|quality| Command::SettingsUpdate { quality })
            }
            Slot::LiveSession => {
                SessionStamp::parse(value).map(|session| Command::Heartbeat { session })
            }
            _ => None,
        };

        match command {
            Some(command) => self.execute(command).await,
            None => Reply::Rejected {
                reason: RejectReason::Invalid,
                details: Some(format!("invalid value {:?} for slot '{}'", value, slot)),
            },
        }
    }

    /// Accept a capture unless one is already in flight
    pub fn start_capture(self: &Arc<Self>) -> Reply {
        let job = {
            let mut in_flight = self.in_flight.lock();
            if let Some(current) = in_flight.as_ref() {
                info!("Rejecting capture request, {} in flight", current.id);
                return busy(format!("capture {} in progress", current.id));
            }
            let seq = self.capture_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let job = CaptureJob {
                id: format!("cap-{}", seq),
                requested_at: self.clock.now_ms(),
            };
            *in_flight = Some(job.clone());
            job
        };

        info!("Capture {} accepted", job.id);
        let ticket = CaptureTicket {
            id: job.id.clone(),
            requested_at: job.requested_at,
            via: ChannelMode::Polling,
        };

        let hub = Arc::clone(self);
        tokio::spawn(async move { hub.run_capture(job).await });

        Reply::CaptureStarted(ticket)
    }

    async fn run_capture(&self, job: CaptureJob) {
        let started = Instant::now();
        let outcome = timeout(self.settings.actuator_timeout, self.actuator.capture(&job)).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        // Strictly newer than the request, so pollers can tell it apart
        let completed_at_ms = self.clock.now_ms().max(job.requested_at + 1);

        let event = match outcome {
            Ok(Ok(result_ref)) => {
                let record =
                    CaptureResultRecord::stored(completed_at_ms, duration_ms, result_ref.clone());
                self.record_result(&job, &record).await;
                CameraEvent::CaptureComplete {
                    id: job.id.clone(),
                    result: result_ref,
                    duration_ms,
                }
            }
            Ok(Err(e)) => {
                let details = e.to_string();
                warn!("Capture {} failed: {}", job.id, details);
                let record = CaptureResultRecord::failed(completed_at_ms, duration_ms, &details);
                self.record_result(&job, &record).await;
                CameraEvent::CaptureFailed {
                    id: job.id.clone(),
                    details,
                }
            }
            Err(_) => CameraEvent::CaptureTimeout { id: job.id.clone() },
        };

        *self.in_flight.lock() = None;
        self.bus.publish(event);
    }

    async fn record_result(&self, job: &CaptureJob, record: &CaptureResultRecord) {
        if let Err(e) = self.store.save(record).await {
            error!("Failed to record result of capture {}: {}", job.id, e);
        }
    }

    pub async fn read_slot(&self, slot: Slot) -> Option<RawSlot> {
        self.store.read_raw(slot).await
    }

    /// Latest capture result, if it completed after `since`
    pub async fn result_since(&self, since: Millis) -> Option<CaptureResultRecord> {
        self.store
            .load::<CaptureResultRecord>()
            .await
            .map(|stamped| stamped.value)
            .filter(|record| record.completed_at_ms > since)
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let now = self.clock.now_ms();
        let telemetry = self.store.load::<CameraTelemetry>().await;
        let live = self.store.load_or(LiveEnabled(false)).await;
        let quality = self.store.load::<StreamQuality>().await;
        let session = self.store.load::<SessionStamp>().await;

        let telemetry_written_at = telemetry.as_ref().map(|t| t.modified_at);
        StatusSnapshot {
            telemetry: telemetry.map(|t| t.value),
            telemetry_written_at,
            online: derive_online(telemetry_written_at, now, self.settings.offline_threshold),
            live_enabled: live.0,
            quality: quality.map(|q| q.value),
            session: session.map(|s| s.value),
            capturing: self.is_capturing(),
            generated_at: now,
        }
    }

    /// One status round: liveness transitions, new frames, then the snapshot
    pub async fn tick(&self) {
        let mut snapshot = self.snapshot().await;

        let change = {
            let mut liveness = self.liveness.lock();
            let change = liveness.observe(snapshot.telemetry_written_at, snapshot.generated_at);
            snapshot.online = liveness.is_online();
            change
        };
        match change {
            Some(LivenessChange::WentOnline) => {
                self.bus.publish(CameraEvent::CameraConnected);
            }
            Some(LivenessChange::WentOffline) => {
                self.bus.publish(CameraEvent::CameraDisconnected);
            }
            None => {}
        }

        if let Some(frame) = self.store.load::<FrameStamp>().await {
            let is_new = {
                let mut last = self.last_frame.lock();
                let is_new = *last != Some(frame.value.frame_id);
                *last = Some(frame.value.frame_id);
                is_new
            };
            if is_new && snapshot.live_enabled {
                self.bus.publish(CameraEvent::LiveFrameReady {
                    frame_id: frame.value.frame_id,
                });
            }
        }

        self.bus.publish(CameraEvent::Status { snapshot });
    }

    /// Spawn the periodic status loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            info!(
                "Hub status loop started ({:?} interval)",
                hub.settings.status_interval
            );
            let mut ticker = interval(hub.settings.status_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => hub.tick().await,
                    _ = token.cancelled() => break,
                }
            }
            info!("Hub status loop stopped");
        })
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    fn store_reply(&self, result: Result<(), StoreError>) -> Reply {
        match result {
            Ok(()) => Reply::Accepted,
            Err(e) => {
                warn!("Hub could not apply command: {}", e);
                Reply::Rejected {
                    reason: RejectReason::Unavailable,
                    details: Some(e.to_string()),
                }
            }
        }
    }
}

fn busy(details: String) -> Reply {
    Reply::Rejected {
        reason: RejectReason::Busy,
        details: Some(details),
    }
}

/// Polling backend served directly by an in-process hub
pub struct LocalBackend {
    hub: Arc<CameraHub>,
}

impl LocalBackend {
    pub fn new(hub: Arc<CameraHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl PollingBackend for LocalBackend {
    async fn write_slot(&self, slot: Slot, value: &str) -> Result<Reply, TransportError> {
        Ok(self.hub.write_slot_value(slot, value).await)
    }

    async fn read_slot(&self, slot: Slot) -> Result<Option<RawSlot>, TransportError> {
        Ok(self.hub.read_slot(slot).await)
    }

    async fn request_capture(&self) -> Result<Reply, TransportError> {
        Ok(self.hub.start_capture())
    }

    async fn result_since(
        &self,
        since: Millis,
    ) -> Result<Option<CaptureResultRecord>, TransportError> {
        Ok(self.hub.result_since(since).await)
    }
}
