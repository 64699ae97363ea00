//! Manages the telephony media WebSocket for a single call.

use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use bytes::Bytes;
use callbridge_core::CallSession;
use futures_util::{SinkExt, StreamExt, future};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, instrument};

/// Agent frames waiting to be written to the provider.
const OUTBOUND_BUFFER: usize = 512;

/// How long queued agent frames may take to flush once the call is over.
const WRITER_FLUSH: Duration = Duration::from_secs(1);

/// Axum handler to upgrade an HTTP connection to a media WebSocket.
pub async fn media_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Runs one call session over `socket` until either side ends the call.
///
/// Reading and writing are independent: inbound frames drive the session on
/// this task, while agent audio is written by a separate task fed from a queue.
#[instrument(name = "media_socket", skip_all)]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let mut send_task = tokio::spawn(
        async move {
            while let Some(frame) = rx.recv().await {
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    debug!("media socket closed while writing");
                    break;
                }
            }
            let _ = sender.close().await;
        }
        .in_current_span(),
    );

    let inbound = receiver
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text.as_str().to_owned()))),
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    let session = CallSession::new(state.sessions.clone(), tx);
    let status = session.run(Box::pin(inbound)).await;
    info!(?status, "media session finished");

    if tokio::time::timeout(WRITER_FLUSH, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}
