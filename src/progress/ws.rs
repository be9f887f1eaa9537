//! WebSocket transport for the progress channel.
//!
//! Clients connect with a bearer token query parameter and a chapter id.
//! Invalid or inactive tokens are rejected with a policy-violation close
//! code before any event flows. Closing the socket never cancels
//! generation; cancellation is a separate authenticated call.

use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::ProgressEvent;
use crate::server::AppState;
use std::sync::Arc;

/// RFC 6455 policy-violation close code, sent on auth failure.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
    pub chapter: Uuid,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(mut socket: WebSocket, params: WsParams, state: Arc<AppState>) {
    let user = state.token_validator.validate(&params.token).await;
    let authorized = matches!(&user, Some(user) if user.active);
    if !authorized {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: "invalid or inactive token".into(),
            })))
            .await;
        return;
    }

    let rx = state.progress.subscribe(params.chapter);
    let heartbeat = Duration::from_secs(state.heartbeat_secs);
    run_socket_loop(socket, params.chapter, rx, heartbeat).await;
    state.progress.remove_if_idle(params.chapter);
}

/// Forward chapter events, interleaving a heartbeat after every
/// `heartbeat` of outbound inactivity. Exits when the client closes or the
/// transport errors.
async fn run_socket_loop(
    mut socket: WebSocket,
    chapter_id: Uuid,
    mut rx: broadcast::Receiver<ProgressEvent>,
    heartbeat: Duration,
) {
    let mut last_sent = Instant::now();
    let mut tick = tokio::time::interval(heartbeat.max(Duration::from_millis(10)));
    tick.tick().await; // first tick resolves immediately

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if last_sent.elapsed() >= heartbeat {
                    let event = ProgressEvent::heartbeat(chapter_id);
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                    last_sent = Instant::now();
                }
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                        last_sent = Instant::now();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%chapter_id, skipped, "progress subscriber lagged");
                        continue;
                    }
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Clients only listen on this channel; ignore.
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}

async fn send_event(socket: &mut WebSocket, event: &ProgressEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize progress event");
            Ok(())
        }
    }
}
