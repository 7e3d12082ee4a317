use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CaptureCompletion, CaptureOutcome, CaptureTicket, ChannelMode, Reply, Transport};
use crate::clock::{Millis, SharedClock};
use crate::error::TransportError;
use crate::events::{Command, LiveAction, RejectReason, StatusSnapshot};
use crate::liveness::derive_online;
use crate::retry::{poll_until, RetryOutcome, RetrySchedule};
use crate::store::{
    CameraTelemetry, CaptureResultRecord, FrameStamp, LiveEnabled, RawSlot, SessionStamp, Slot,
    SlotSchema, Stamped, StreamQuality,
};

/// Discrete operations the polling channel is built from
#[async_trait]
pub trait PollingBackend: Send + Sync {
    async fn write_slot(&self, slot: Slot, value: &str) -> Result<Reply, TransportError>;

    async fn read_slot(&self, slot: Slot) -> Result<Option<RawSlot>, TransportError>;

    /// Ask for a capture; answered with a ticket or a busy rejection
    async fn request_capture(&self) -> Result<Reply, TransportError>;

    /// The capture result, if one completed after `since`
    async fn result_since(&self, since: Millis)
        -> Result<Option<CaptureResultRecord>, TransportError>;
}

/// Request/response transport over slot reads and writes
pub struct PollingTransport {
    backend: Arc<dyn PollingBackend>,
    schedule: RetrySchedule,
    offline_threshold: Duration,
    clock: SharedClock,
}

impl PollingTransport {
    pub fn new(
        backend: Arc<dyn PollingBackend>,
        schedule: RetrySchedule,
        offline_threshold: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            backend,
            schedule,
            offline_threshold,
            clock,
        }
    }

    async fn load<S: SlotSchema>(&self) -> Result<Option<Stamped<S>>, TransportError> {
        let raw = self.backend.read_slot(S::SLOT).await?;
        Ok(raw.and_then(|raw| {
            S::parse(&raw.content).map(|value| Stamped {
                value,
                modified_at: raw.modified_at,
            })
        }))
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn mode(&self) -> ChannelMode {
        ChannelMode::Polling
    }

    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<Reply, TransportError> {
        debug!("Polling transport sending {}", command.name());
        match command {
            Command::Capture => self.backend.request_capture().await,
            Command::LiveControl { action } => {
                let value = LiveEnabled(action == LiveAction::Start);
                self.backend
                    .write_slot(Slot::LiveEnabled, &value.render())
                    .await
            }
            Command::SettingsUpdate { quality } => {
                self.backend
                    .write_slot(Slot::LiveQuality, &quality.render())
                    .await
            }
            Command::Heartbeat { session } => {
                self.backend
                    .write_slot(Slot::LiveSession, &session.render())
                    .await
            }
            // Nothing is pushed on this channel, so there is nothing to stop
            Command::FrameFeed { .. } => Ok(Reply::Accepted),
        }
    }

    async fn status(&self) -> Result<StatusSnapshot, TransportError> {
        let (telemetry, live, quality, session) = futures::try_join!(
            self.load::<CameraTelemetry>(),
            self.load::<LiveEnabled>(),
            self.load::<StreamQuality>(),
            self.load::<SessionStamp>(),
        )?;

        let now = self.clock.now_ms();
        let telemetry_written_at = telemetry.as_ref().map(|t| t.modified_at);
        Ok(StatusSnapshot {
            telemetry: telemetry.map(|t| t.value),
            telemetry_written_at,
            online: derive_online(telemetry_written_at, now, self.offline_threshold),
            live_enabled: live.map(|l| l.value.0).unwrap_or(false),
            quality: quality.map(|q| q.value),
            session: session.map(|s| s.value),
            capturing: false,
            generated_at: now,
        })
    }

    async fn await_capture(&self, ticket: &CaptureTicket) -> Result<CaptureOutcome, TransportError> {
        let backend = Arc::clone(&self.backend);
        let since = ticket.requested_at;

        let outcome = poll_until(self.schedule, move |_| {
            let backend = Arc::clone(&backend);
            async move { backend.result_since(since).await }
        })
        .await;

        Ok(match outcome {
            RetryOutcome::Completed { value, attempts } => {
                debug!(
                    "Capture {} result found after {} polls",
                    ticket.id, attempts
                );
                match value.failure {
                    Some(details) => CaptureOutcome::Failed { details },
                    None => CaptureOutcome::Completed(CaptureCompletion {
                        id: ticket.id.clone(),
                        result_ref: value.result_ref,
                        duration_ms: value.duration_ms,
                    }),
                }
            }
            RetryOutcome::TimedOut { attempts, elapsed } => {
                warn!(
                    "No result for capture {} after {} polls ({:?})",
                    ticket.id, attempts, elapsed
                );
                CaptureOutcome::TimedOut
            }
        })
    }

    async fn latest_frame(&self) -> Result<Option<u64>, TransportError> {
        Ok(self.load::<FrameStamp>().await?.map(|s| s.value.frame_id))
    }
}

/// Slot content as served by the hub's HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotBody {
    pub content: String,
    pub modified_at: Millis,
}

/// Body of an accepted `POST /api/capture`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureAccepted {
    pub id: String,
    pub requested_at: Millis,
}

/// Error body returned alongside non-success statuses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub reason: RejectReason,
    pub details: Option<String>,
}

/// Polling backend talking to a remote hub over HTTP
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Request {
                details: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn rejection(response: reqwest::Response) -> Reply {
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => Reply::Rejected {
                reason: body.reason,
                details: body.details,
            },
            Err(_) => Reply::Rejected {
                reason: reason_for_status(status),
                details: Some(status.to_string()),
            },
        }
    }
}

fn request_error(e: reqwest::Error) -> TransportError {
    TransportError::Request {
        details: e.to_string(),
    }
}

fn unexpected(status: StatusCode) -> TransportError {
    TransportError::Protocol {
        details: format!("unexpected status {}", status),
    }
}

fn reason_for_status(status: StatusCode) -> RejectReason {
    match status {
        StatusCode::CONFLICT => RejectReason::Busy,
        StatusCode::SERVICE_UNAVAILABLE => RejectReason::Unavailable,
        _ => RejectReason::Invalid,
    }
}

#[async_trait]
impl PollingBackend for HttpBackend {
    async fn write_slot(&self, slot: Slot, value: &str) -> Result<Reply, TransportError> {
        let response = self
            .client
            .put(self.url(&format!("/api/slots/{}", slot.name())))
            .body(value.to_string())
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            status if status.is_success() => Ok(Reply::Accepted),
            status if status.is_client_error() || status == StatusCode::SERVICE_UNAVAILABLE => {
                Ok(Self::rejection(response).await)
            }
            status => Err(unexpected(status)),
        }
    }

    async fn read_slot(&self, slot: Slot) -> Result<Option<RawSlot>, TransportError> {
        let response = self
            .client
            .get(self.url(&format!("/api/slots/{}", slot.name())))
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::OK => {
                let body: SlotBody = response.json().await.map_err(|e| {
                    TransportError::Protocol {
                        details: e.to_string(),
                    }
                })?;
                Ok(Some(RawSlot {
                    content: body.content,
                    modified_at: body.modified_at,
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected(status)),
        }
    }

    async fn request_capture(&self) -> Result<Reply, TransportError> {
        let response = self
            .client
            .post(self.url("/api/capture"))
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK => {
                let accepted: CaptureAccepted =
                    response
                        .json()
                        .await
                        .map_err(|e| TransportError::Protocol {
                            details: e.to_string(),
                        })?;
                Ok(Reply::CaptureStarted(CaptureTicket {
                    id: accepted.id,
                    requested_at: accepted.requested_at,
                    via: ChannelMode::Polling,
                }))
            }
            status if status.is_client_error() || status == StatusCode::SERVICE_UNAVAILABLE => {
                Ok(Self::rejection(response).await)
            }
            status => Err(unexpected(status)),
        }
    }

    async fn result_since(
        &self,
        since: Millis,
    ) -> Result<Option<CaptureResultRecord>, TransportError> {
        let response = self
            .client
            .get(self.url("/api/capture/result"))
            .query(&[("since", since)])
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::OK => response
                .json::<CaptureResultRecord>()
                .await
                .map(Some)
                .map_err(|e| TransportError::Protocol {
                    details: e.to_string(),
                }),
            StatusCode::NO_CONTENT => Ok(None),
            status => Err(unexpected(status)),
        }
    }
}
