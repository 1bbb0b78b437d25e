//! Live update WebSocket routes
//!
//! Position streams follow one game for as long as a worker analyzes it.
//! Analysis streams are bound to one analysis target and are force-closed by
//! the worker when its target changes; clients observe the close and
//! re-subscribe with the new thinking id.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::Path,
    response::IntoResponse,
    Extension,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::state::AppState;

pub async fn positions_ws(
    Path(game_id): Path<i64>,
    Extension(state): Extension<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state
        .worker_for_game(game_id)
        .map(|worker| worker.broadcaster.subscribe_positions());
    ws.on_upgrade(move |mut socket| async move {
        match rx {
            Some(rx) => forward_frames(socket, rx).await,
            None => {
                debug!(game_id, "position subscription for game not under analysis");
                let _ = socket.send(Message::Close(None)).await;
            }
        }
    })
}

pub async fn analysis_ws(
    Path(thinking_id): Path<i64>,
    Extension(state): Extension<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state
        .worker_for_thinking(thinking_id)
        .and_then(|worker| worker.broadcaster.subscribe_analysis(thinking_id));
    ws.on_upgrade(move |mut socket| async move {
        match rx {
            Some(rx) => forward_frames(socket, rx).await,
            None => {
                debug!(thinking_id, "analysis subscription for stale target");
                let _ = socket.send(Message::Close(None)).await;
            }
        }
    })
}

/// Pump frames out until the subscription is closed upstream or the client
/// goes away.
async fn forward_frames<T: Serialize>(mut socket: WebSocket, mut rx: mpsc::UnboundedReceiver<T>) {
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(json) = serde_json::to_string(&frame) else { break };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
