//! Per-session change feed: current snapshot first, then one frame per commit.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use server_api::load_snapshot;
use shared::{domain::SessionId, protocol::ServerEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{app_state::AppState, http_error};

pub(crate) async fn session_feed(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
) -> Response {
    let session_id = SessionId(session_id);
    if let Err(err) = load_snapshot(&state.api, session_id).await {
        return http_error(err).into_response();
    }
    ws.on_upgrade(move |socket| stream_session(socket, state, session_id))
}

async fn stream_session(mut socket: WebSocket, state: Arc<AppState>, session_id: SessionId) {
    // Subscribe before reading so nothing committed in between is missed.
    let mut rx = state.api.notifier.subscribe();
    info!(session_id = session_id.0, "observer subscribed");

    if !send_current(&mut socket, &state, session_id).await {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(event) => {
                    if event.session_id() != Some(session_id) {
                        continue;
                    }
                    if !send_event(&mut socket, &event).await {
                        debug!(session_id = session_id.0, "observer disconnected (send failed)");
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = session_id.0, skipped, "observer lagged; resyncing");
                    if !send_current(&mut socket, &state, session_id).await {
                        return;
                    }
                }
                Err(RecvError::Closed) => {
                    debug!(session_id = session_id.0, "change feed closed");
                    return;
                }
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    info!(session_id = session_id.0, "observer disconnected");
                    return;
                }
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        return;
                    }
                }
                Some(Err(error)) => {
                    debug!(session_id = session_id.0, %error, "observer socket error");
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Sends the stored snapshot, or an error frame when it cannot be read.
/// Returns false once the socket is gone.
async fn send_current(socket: &mut WebSocket, state: &AppState, session_id: SessionId) -> bool {
    let event = match load_snapshot(&state.api, session_id).await {
        Ok(snapshot) => ServerEvent::SessionChanged { snapshot },
        Err(err) => {
            warn!(session_id = session_id.0, error = %err, "snapshot unavailable for observer");
            ServerEvent::Error(err)
        }
    };
    send_event(socket, &event).await
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(error) => {
            warn!(%error, "failed to serialize change event");
            return true;
        }
    };
    socket.send(Message::Text(text)).await.is_ok()
}
