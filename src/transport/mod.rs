//! Channel abstraction between a client and the camera hub.
//!
//! Two interchangeable transports speak the same logical commands: the
//! [`EventTransport`] keeps a WebSocket open and gets pushed events, the
//! [`PollingTransport`] expresses everything as discrete slot reads and
//! writes. [`FailoverTransport`] picks between them so callers never see
//! which one carried a request.

mod event;
mod failover;
mod polling;

pub use event::EventTransport;
pub use failover::{FailoverPolicy, FailoverTransport};
pub use polling::{
    CaptureAccepted, ErrorBody, HttpBackend, PollingBackend, PollingTransport, SlotBody,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::clock::Millis;
use crate::error::TransportError;
use crate::events::{Command, RejectReason, StatusSnapshot};

/// Which channel currently carries traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    Event,
    Polling,
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMode::Event => f.write_str("event"),
            ChannelMode::Polling => f.write_str("polling"),
        }
    }
}

/// Handle for an accepted capture, used to wait for its completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureTicket {
    pub id: String,
    /// Hub time at which the capture was accepted; results older than this
    /// belong to a previous capture
    pub requested_at: Millis,
    pub via: ChannelMode,
}

/// Reply to a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Accepted,
    CaptureStarted(CaptureTicket),
    Rejected {
        reason: RejectReason,
        details: Option<String>,
    },
}

impl Reply {
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Reply::Rejected {
                reason: RejectReason::Busy,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCompletion {
    pub id: String,
    pub result_ref: String,
    pub duration_ms: u64,
}

/// Terminal state of a capture as seen by the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Completed(CaptureCompletion),
    Failed { details: String },
    TimedOut,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Channel that would serve the next request
    fn mode(&self) -> ChannelMode;

    fn is_connected(&self) -> bool {
        true
    }

    /// Establish (or re-establish) the channel
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) {}

    async fn send(&self, command: Command) -> Result<Reply, TransportError>;

    async fn status(&self) -> Result<StatusSnapshot, TransportError>;

    /// Wait for the capture behind `ticket` to reach a terminal state.
    ///
    /// Client-side timeouts are reported as [`CaptureOutcome::TimedOut`];
    /// an error means the channel itself went away mid-wait.
    async fn await_capture(&self, ticket: &CaptureTicket) -> Result<CaptureOutcome, TransportError>;

    /// Id of the most recent live frame, if any
    async fn latest_frame(&self) -> Result<Option<u64>, TransportError>;
}

pub type SharedTransport = Arc<dyn Transport>;

/// `http://host:port` to `ws://host:port/ws`
pub fn websocket_url(hub_url: &str) -> String {
    let trimmed = hub_url.trim_end_matches('/');
    let rest = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{}", trimmed)
    };
    format!("{}/ws", rest)
}
