//! Command/event protocol spoken over the event channel, and the in-process
//! bus the hub uses to fan events out to connected clients.
//!
//! Messages are JSON objects discriminated by `type`:
//!
//! ```json
//! // client -> hub
//! {"type": "capture", "requestId": "r-17"}
//! {"type": "live_control", "requestId": "r-18", "action": "start"}
//! // hub -> client
//! {"type": "capture_started", "id": "cap-3", "requestId": "r-17", "requestedAt": 1700000000000}
//! {"type": "capture_complete", "id": "cap-3", "result": "captures/cap-3.jpg", "durationMs": 2000}
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::Millis;
use crate::store::{CameraTelemetry, SessionStamp, StreamQuality};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveAction {
    Start,
    Stop,
}

/// Intents a client sends to the camera side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    Capture,
    LiveControl { action: LiveAction },
    SettingsUpdate { quality: StreamQuality },
    Heartbeat { session: SessionStamp },
    FrameFeed { enabled: bool },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Capture => "capture",
            Command::LiveControl { .. } => "live_control",
            Command::SettingsUpdate { .. } => "settings_update",
            Command::Heartbeat { .. } => "heartbeat",
            Command::FrameFeed { .. } => "frame_feed",
        }
    }
}

/// A command plus the correlation id its reply will carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The camera is occupied by another operation
    Busy,
    /// The command could not be understood or applied
    Invalid,
    /// Accepted but the shared state could not be written
    Unavailable,
}

/// Camera-side view of the shared state, pushed periodically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub telemetry: Option<CameraTelemetry>,
    pub telemetry_written_at: Option<Millis>,
    pub online: bool,
    pub live_enabled: bool,
    pub quality: Option<StreamQuality>,
    pub session: Option<SessionStamp>,
    pub capturing: bool,
    pub generated_at: Millis,
}

/// Events emitted by the camera side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CameraEvent {
    Status {
        snapshot: StatusSnapshot,
    },
    Ack {
        request_id: String,
    },
    CommandRejected {
        request_id: Option<String>,
        reason: RejectReason,
        details: Option<String>,
    },
    CaptureStarted {
        id: String,
        request_id: Option<String>,
        requested_at: Millis,
    },
    CaptureComplete {
        id: String,
        result: String,
        duration_ms: u64,
    },
    CaptureTimeout {
        id: String,
    },
    CaptureFailed {
        id: String,
        details: String,
    },
    LiveFrameReady {
        frame_id: u64,
    },
    CameraConnected,
    CameraDisconnected,
}

impl CameraEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            CameraEvent::Status { snapshot } => format!(
                "Status (online: {}, live: {}, capturing: {})",
                snapshot.online, snapshot.live_enabled, snapshot.capturing
            ),
            CameraEvent::Ack { request_id } => format!("Ack for {}", request_id),
            CameraEvent::CommandRejected {
                request_id, reason, ..
            } => format!("Command {:?} rejected: {:?}", request_id, reason),
            CameraEvent::CaptureStarted { id, .. } => format!("Capture started: {}", id),
            CameraEvent::CaptureComplete {
                id, duration_ms, ..
            } => format!("Capture completed: {} ({} ms)", id, duration_ms),
            CameraEvent::CaptureTimeout { id } => format!("Capture timed out: {}", id),
            CameraEvent::CaptureFailed { id, details } => {
                format!("Capture failed: {} ({})", id, details)
            }
            CameraEvent::LiveFrameReady { frame_id } => format!("Live frame {} ready", frame_id),
            CameraEvent::CameraConnected => "Camera connected".to_string(),
            CameraEvent::CameraDisconnected => "Camera disconnected".to_string(),
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            CameraEvent::Status { .. } => "status",
            CameraEvent::Ack { .. } => "ack",
            CameraEvent::CommandRejected { .. } => "command_rejected",
            CameraEvent::CaptureStarted { .. } => "capture_started",
            CameraEvent::CaptureComplete { .. } => "capture_complete",
            CameraEvent::CaptureTimeout { .. } => "capture_timeout",
            CameraEvent::CaptureFailed { .. } => "capture_failed",
            CameraEvent::LiveFrameReady { .. } => "live_frame_ready",
            CameraEvent::CameraConnected => "camera_connected",
            CameraEvent::CameraDisconnected => "camera_disconnected",
        }
    }

    /// Replies addressed to one requester rather than every client
    pub fn reply_to(&self) -> Option<&str> {
        match self {
            CameraEvent::Ack { request_id } => Some(request_id),
            CameraEvent::CommandRejected { request_id, .. }
            | CameraEvent::CaptureStarted { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// Broadcast fan-out of camera events to every connected client
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CameraEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers; returns how many received it.
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: CameraEvent) -> usize {
        match &event {
            CameraEvent::CameraConnected => info!("Camera connected"),
            CameraEvent::CameraDisconnected => warn!("Camera disconnected"),
            CameraEvent::CaptureTimeout { id } => warn!("Capture {} timed out", id),
            CameraEvent::CaptureFailed { .. } => warn!("{}", event.description()),
            CameraEvent::CaptureStarted { .. } | CameraEvent::CaptureComplete { .. } => {
                info!("{}", event.description())
            }
            _ => debug!("Event: {}", event.description()),
        }

        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_command_wire_format() {
        let envelope = CommandEnvelope {
            request_id: "r-1".to_string(),
            command: Command::LiveControl {
                action: LiveAction::Start,
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"type": "live_control", "requestId": "r-1", "action": "start"})
        );

        let parsed: CommandEnvelope =
            serde_json::from_value(json!({"type": "capture", "requestId": "r-2"})).unwrap();
        assert_eq!(parsed.command, Command::Capture);
        assert_eq!(parsed.request_id, "r-2");
    }

    #[test]
    fn test_event_wire_format() {
        let event = CameraEvent::CaptureComplete {
            id: "cap-1".to_string(),
            result: "captures/cap-1.jpg".to_string(),
            duration_ms: 2000,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "capture_complete",
                "id": "cap-1",
                "result": "captures/cap-1.jpg",
                "durationMs": 2000
            })
        );

        let parsed: CameraEvent =
            serde_json::from_value(json!({"type": "camera_disconnected"})).unwrap();
        assert_eq!(parsed, CameraEvent::CameraDisconnected);
    }

    #[test]
    fn test_unknown_command_type_is_rejected() {
        let parsed = serde_json::from_value::<CommandEnvelope>(
            json!({"type": "format_sd_card", "requestId": "r-3"}),
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_reply_routing() {
        let ack = CameraEvent::Ack {
            request_id: "r-9".to_string(),
        };
        assert_eq!(ack.reply_to(), Some("r-9"));
        assert_eq!(CameraEvent::CameraConnected.reply_to(), None);
    }

    #[tokio::test]
    async fn test_event_bus_basic_operations() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        let delivered = event_bus.publish(CameraEvent::LiveFrameReady { frame_id: 7 });
        assert_eq!(delivered, 2);

        for receiver in [&mut receiver1, &mut receiver2] {
            let event = timeout(Duration::from_millis(100), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event, CameraEvent::LiveFrameReady { frame_id: 7 });
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let event_bus = EventBus::new(10);
        assert_eq!(event_bus.publish(CameraEvent::CameraConnected), 0);
    }
}
