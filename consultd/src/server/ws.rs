//! WebSocket transport into the room relay.
//!
//! The endpoint is admitted to the room before the upgrade, so a request
//! for a session that is not active is refused with an ordinary HTTP error
//! and never sees a single event.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::handlers::Participant;
use super::{ApiError, AppState};
use crate::models::{Envelope, RelayEvent};
use crate::relay::Connection;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub session_id: String,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Query(params): Query<WsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (tx, rx) = mpsc::channel(state.channel_capacity);
    let connection = state.relay.join(&params.session_id, &participant, tx)?;
    Ok(ws.on_upgrade(move |socket| {
        handle_websocket(socket, state, params.session_id, participant, connection, rx)
    }))
}

async fn handle_websocket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    participant: String,
    connection: Connection,
    mut rx: mpsc::Receiver<Envelope>,
) {
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                // None: the room was closed and dropped our sender.
                let Some(envelope) = outbound else { break };
                let Ok(json) = serde_json::to_string(&envelope) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_inbound(&state, &session_id, &participant, text.as_str()) {
                        if socket.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    let _ = state.manager.heartbeat(&session_id, &participant);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%session_id, %participant, error = %err, "websocket receive failed");
                    break;
                }
            }
        }
    }

    state.relay.leave(&session_id, &participant, connection);
    let _ = socket.send(Message::Close(None)).await;
}

/// Apply one client frame. Returns an error frame to send back, if any.
fn handle_inbound(
    state: &AppState,
    session_id: &str,
    participant: &str,
    text: &str,
) -> Option<String> {
    let event = match serde_json::from_str::<RelayEvent>(text) {
        Ok(event) if event.is_client_originated() => event,
        Ok(event) => {
            return Some(error_frame(&ApiError::bad_request(format!(
                "{} events cannot be sent by clients",
                event.type_label()
            ))))
        }
        Err(err) => {
            return Some(error_frame(&ApiError::bad_request(format!(
                "malformed event: {err}"
            ))))
        }
    };

    let result = match event {
        RelayEvent::SessionEnd { .. } => state.manager.end(session_id, participant).map(|_| ()),
        event => state
            .relay
            .broadcast(session_id, participant, event, true)
            .map(|_| ()),
    };
    match result {
        Ok(()) => None,
        Err(err) => {
            warn!(session_id, participant, error = %err, "relay rejected event");
            Some(error_frame(&ApiError::from(err)))
        }
    }
}

fn error_frame(err: &ApiError) -> String {
    serde_json::json!({
        "type": "error",
        "code": err.code,
        "message": err.message,
        "retryable": err.retryable,
    })
    .to_string()
}
