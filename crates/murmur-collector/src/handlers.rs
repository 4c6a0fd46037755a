//! Ingest and status handlers.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::decode::{DecodeLoop, DeviceStatus, PacketSink};
use crate::CollectorState;

// ── /ingest ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct IngestParams {
    pub token: Option<String>,
}

pub async fn handle_ingest(
    State(state): State<CollectorState>,
    Query(params): Query<IngestParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let device_id = params
        .token
        .as_deref()
        .and_then(|token| state.tokens.validate(token));
    let Some(device_id) = device_id else {
        tracing::warn!("ingest rejected: invalid token");
        return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
    };

    let sink = state.sink.clone();
    ws.on_upgrade(move |socket| ingest_session(socket, device_id, sink))
}

async fn ingest_session(mut socket: WebSocket, device_id: String, sink: Arc<dyn PacketSink>) {
    tracing::info!(device_id = %device_id, "device connected");
    sink.connection(&device_id, true);

    let mut decoder = DecodeLoop::new(device_id.clone(), sink.clone());
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Binary(data)) => {
                // malformed frames are logged by the decoder; keep reading
                let _ = decoder.on_message(&data);
            }
            Ok(Message::Text(text)) => {
                tracing::debug!(device_id = %device_id, len = text.len(), "ignoring text message");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(device_id = %device_id, error = %e, "ingest read failed");
                break;
            }
        }
    }

    sink.connection(&device_id, false);
    tracing::info!(
        device_id = %device_id,
        last_seq = ?decoder.last_sequence_id(),
        "device disconnected"
    );
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub devices: Vec<DeviceStatus>,
    pub active_tokens: usize,
}

pub async fn handle_status(State(state): State<CollectorState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        devices: state.stats.snapshot(),
        active_tokens: state.tokens.len(),
    })
}

pub async fn handle_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}
