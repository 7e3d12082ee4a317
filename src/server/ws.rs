//! Event channel endpoint.
//!
//! Each connection gets the hub's broadcast events plus direct replies to
//! its own commands. Replies are never broadcast; frame announcements stop
//! once the client turns its frame feed off.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::app::ServerState;
use crate::events::{CameraEvent, Command, CommandEnvelope, RejectReason};
use crate::transport::Reply;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.hub.events().subscribe();
    let mut frame_feed = true;
    info!("Event channel client connected");

    let snapshot = state.hub.snapshot().await;
    if send_event(&mut sender, &CameraEvent::Status { snapshot })
        .await
        .is_err()
    {
        debug!("Client left before the first status");
        return;
    }

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_command(&state, &text, &mut frame_feed).await;
                    if send_event(&mut sender, &reply).await.is_err() {
                        debug!("Failed to send reply, client disconnected");
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Event channel error: {}", e);
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if event.reply_to().is_some() {
                        continue;
                    }
                    if !frame_feed && matches!(event, CameraEvent::LiveFrameReady { .. }) {
                        continue;
                    }
                    if send_event(&mut sender, &event).await.is_err() {
                        debug!("Failed to forward event, client disconnected");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event channel client lagging, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Event channel client disconnected");
}

async fn handle_command(state: &ServerState, text: &str, frame_feed: &mut bool) -> CameraEvent {
    let envelope: CommandEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Unparsable command {:?}: {}", text, e);
            return CameraEvent::CommandRejected {
                request_id: None,
                reason: RejectReason::Invalid,
                details: Some(e.to_string()),
            };
        }
    };

    let request_id = envelope.request_id;
    if let Command::FrameFeed { enabled } = envelope.command {
        debug!("Frame feed {} for this client", if enabled { "on" } else { "off" });
        *frame_feed = enabled;
    }

    match state.hub.execute(envelope.command).await {
        Reply::Accepted => CameraEvent::Ack { request_id },
        Reply::CaptureStarted(ticket) => CameraEvent::CaptureStarted {
            id: ticket.id,
            request_id: Some(request_id),
            requested_at: ticket.requested_at,
        },
        Reply::Rejected { reason, details } => CameraEvent::CommandRejected {
            request_id: Some(request_id),
            reason,
            details,
        },
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &CameraEvent,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize {}: {}", event.event_type(), e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json)).await
}
