use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::debug;

use super::app::ServerState;
use crate::clock::Millis;
use crate::events::RejectReason;
use crate::store::Slot;
use crate::transport::{CaptureAccepted, ErrorBody, Reply, SlotBody};

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    since: Millis,
}

/// Handler for health check endpoint
pub async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "capturing": state.hub.is_capturing(),
        "event_clients": state.hub.events().subscriber_count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

pub async fn status_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.hub.snapshot().await)
}

pub async fn read_slot_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    let Some(slot) = Slot::from_name(&name) else {
        return unknown_slot(&name);
    };

    match state.hub.read_slot(slot).await {
        Some(raw) => Json(SlotBody {
            content: raw.content,
            modified_at: raw.modified_at,
        })
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn write_slot_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    body: String,
) -> Response {
    let Some(slot) = Slot::from_name(&name) else {
        return unknown_slot(&name);
    };

    debug!("Slot write {} = {:?}", slot, body);
    reply_response(state.hub.write_slot_value(slot, &body).await)
}

pub async fn capture_handler(State(state): State<ServerState>) -> Response {
    reply_response(state.hub.start_capture())
}

pub async fn capture_result_handler(
    State(state): State<ServerState>,
    Query(query): Query<ResultQuery>,
) -> Response {
    match state.hub.result_since(query.since).await {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn unknown_slot(name: &str) -> Response {
    rejection(RejectReason::Invalid, Some(format!("unknown slot '{}'", name)))
}

fn reply_response(reply: Reply) -> Response {
    match reply {
        Reply::Accepted => StatusCode::NO_CONTENT.into_response(),
        Reply::CaptureStarted(ticket) => (
            StatusCode::ACCEPTED,
            Json(CaptureAccepted {
                id: ticket.id,
                requested_at: ticket.requested_at,
            }),
        )
            .into_response(),
        Reply::Rejected { reason, details } => rejection(reason, details),
    }
}

fn rejection(reason: RejectReason, details: Option<String>) -> Response {
    let status = match reason {
        RejectReason::Busy => StatusCode::CONFLICT,
        RejectReason::Invalid => StatusCode::BAD_REQUEST,
        RejectReason::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(ErrorBody { reason, details })).into_response()
}
