//! Manages dashboard observer WebSockets.

use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{Instrument, debug, instrument};

/// Axum handler to upgrade an HTTP connection to an observer WebSocket.
pub async fn observer_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Streams call events to one observer until it disconnects. Anything the
/// observer sends is ignored.
#[instrument(name = "observer_socket", skip_all)]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = state.broadcaster.observer_channel();
    let observer_id = state.broadcaster.on_observer_connect(tx);

    let mut send_task = tokio::spawn(
        async move {
            while let Some(json) = rx.recv().await {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let mut recv_task = tokio::spawn(
        async move {
            while let Some(Ok(msg)) = receiver.next().await {
                match msg {
                    Message::Close(_) => break,
                    Message::Text(text) => debug!(len = text.as_str().len(), "ignoring observer message"),
                    _ => {}
                }
            }
        }
        .in_current_span(),
    );

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.broadcaster.remove_observer(observer_id);
}
