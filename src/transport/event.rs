use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{CaptureCompletion, CaptureOutcome, CaptureTicket, ChannelMode, Reply, Transport};
use crate::error::TransportError;
use crate::events::{CameraEvent, Command, CommandEnvelope, StatusSnapshot};

/// Finished captures kept for late waiters
const FINISHED_CAPACITY: usize = 64;

/// State shared between the transport and its reader task
#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    finished: Mutex<HashMap<String, CaptureOutcome>>,
    capture_signal: Notify,
    status: Mutex<Option<StatusSnapshot>>,
    frame: Mutex<Option<u64>>,
}

impl Shared {
    fn dispatch(&self, text: &str) {
        let event: CameraEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring unparsable event {:?}: {}", text, e);
                return;
            }
        };
        debug!("Event channel received {}", event.event_type());

        match event {
            CameraEvent::Ack { request_id } => self.resolve(&request_id, Reply::Accepted),
            CameraEvent::CommandRejected {
                request_id: Some(request_id),
                reason,
                details,
            } => self.resolve(&request_id, Reply::Rejected { reason, details }),
            CameraEvent::CommandRejected {
                request_id: None,
                reason,
                details,
            } => warn!("Hub rejected an unidentified command: {:?} {:?}", reason, details),
            CameraEvent::CaptureStarted {
                id,
                request_id,
                requested_at,
            } => {
                if let Some(request_id) = request_id {
                    let ticket = CaptureTicket {
                        id,
                        requested_at,
                        via: ChannelMode::Event,
                    };
                    self.resolve(&request_id, Reply::CaptureStarted(ticket));
                }
            }
            CameraEvent::CaptureComplete {
                id,
                result,
                duration_ms,
            } => self.finish(
                id.clone(),
                CaptureOutcome::Completed(CaptureCompletion {
                    id,
                    result_ref: result,
                    duration_ms,
                }),
            ),
            CameraEvent::CaptureTimeout { id } => self.finish(id, CaptureOutcome::TimedOut),
            CameraEvent::CaptureFailed { id, details } => {
                self.finish(id, CaptureOutcome::Failed { details })
            }
            CameraEvent::Status { snapshot } => *self.status.lock() = Some(snapshot),
            CameraEvent::LiveFrameReady { frame_id } => *self.frame.lock() = Some(frame_id),
            CameraEvent::CameraConnected | CameraEvent::CameraDisconnected => {}
        }
    }

    fn resolve(&self, request_id: &str, reply: Reply) {
        match self.pending.lock().remove(request_id) {
            Some(sender) => {
                let _ = sender.send(reply);
            }
            None => debug!("Reply for unknown or expired request {}", request_id),
        }
    }

    fn finish(&self, id: String, outcome: CaptureOutcome) {
        {
            let mut finished = self.finished.lock();
            if finished.len() >= FINISHED_CAPACITY {
                finished.clear();
            }
            finished.insert(id, outcome);
        }
        self.capture_signal.notify_waiters();
    }

    fn closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every in-flight request
        self.pending.lock().clear();
        *self.status.lock() = None;
        self.capture_signal.notify_waiters();
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Persistent WebSocket channel to the hub
pub struct EventTransport {
    url: String,
    connect_timeout: Duration,
    capture_timeout: Duration,
    shared: Arc<Shared>,
    connection: Mutex<Option<Connection>>,
}

impl EventTransport {
    /// `connect_timeout` bounds both the handshake and each command's reply;
    /// `capture_timeout` bounds the wait for a capture's terminal event.
    pub fn new(url: impl Into<String>, connect_timeout: Duration, capture_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            capture_timeout,
            shared: Arc::new(Shared::default()),
            connection: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn outgoing(&self) -> Result<mpsc::UnboundedSender<Message>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.connection
            .lock()
            .as_ref()
            .map(|connection| connection.outgoing.clone())
            .ok_or(TransportError::Disconnected)
    }
}

#[async_trait]
impl Transport for EventTransport {
    fn mode(&self) -> ChannelMode {
        ChannelMode::Event
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        debug!("Connecting event channel to {}", self.url);
        let (stream, _response) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout {
                timeout: self.connect_timeout,
            })?
            .map_err(|e| TransportError::Connect {
                endpoint: self.url.clone(),
                details: e.to_string(),
            })?;

        let (mut sink, mut source) = stream.split();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("Event channel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => shared.dispatch(&text),
                    Ok(Message::Close(frame)) => {
                        debug!("Hub closed the event channel: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Event channel read failed: {}", e);
                        break;
                    }
                }
            }
            info!("Event channel closed");
            shared.closed();
        });

        self.shared.connected.store(true, Ordering::SeqCst);
        let previous = self.connection.lock().replace(Connection {
            outgoing,
            reader,
            writer,
        });
        if let Some(previous) = previous {
            previous.abort();
        }

        info!("Event channel connected to {}", self.url);
        Ok(())
    }

    async fn disconnect(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.abort();
        }
        self.shared.closed();
    }

    async fn send(&self, command: Command) -> Result<Reply, TransportError> {
        let outgoing = self.outgoing()?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let envelope = CommandEnvelope {
            request_id: request_id.clone(),
            command,
        };
        let text = serde_json::to_string(&envelope).map_err(|e| TransportError::Protocol {
            details: e.to_string(),
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .insert(request_id.clone(), reply_tx);

        if outgoing.send(Message::Text(text)).is_err() {
            self.shared.pending.lock().remove(&request_id);
            return Err(TransportError::Disconnected);
        }
        debug!(
            "Sent {} as request {}",
            envelope.command.name(),
            request_id
        );

        match timeout(self.connect_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().remove(&request_id);
                Err(TransportError::Timeout {
                    timeout: self.connect_timeout,
                })
            }
        }
    }

    async fn status(&self) -> Result<StatusSnapshot, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.shared
            .status
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Protocol {
                details: "no status received yet".to_string(),
            })
    }

    async fn await_capture(&self, ticket: &CaptureTicket) -> Result<CaptureOutcome, TransportError> {
        let deadline = Instant::now() + self.capture_timeout;

        loop {
            let notified = self.shared.capture_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.shared.finished.lock().remove(&ticket.id) {
                return Ok(outcome);
            }
            if !self.is_connected() {
                return Err(TransportError::Disconnected);
            }

            if timeout_at(deadline, notified).await.is_err() {
                warn!(
                    "No terminal event for capture {} within {:?}",
                    ticket.id, self.capture_timeout
                );
                return Ok(CaptureOutcome::TimedOut);
            }
        }
    }

    async fn latest_frame(&self) -> Result<Option<u64>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Ok(*self.shared.frame.lock())
    }
}

impl Drop for EventTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.abort();
        }
    }
}
