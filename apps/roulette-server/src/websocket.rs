use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::channel::WsChannel;
use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drives one client connection: register on open, relay every text frame,
/// unregister once the socket closes or errors.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (channel, mut outbox) = WsChannel::new();
    let channel = Arc::new(channel);

    let session_id = state.roulette.lock().register(channel.clone());
    info!(session_id = %session_id, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(err) = sink.send(message).await {
                debug!(session_id = %session_id, error = %err, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.roulette.lock().handle_message(session_id, &text);
            }
            Ok(Message::Binary(bytes)) => {
                warn!(session_id = %session_id, len = bytes.len(), "ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "websocket error");
                break;
            }
        }
    }

    channel.mark_closed();
    state.roulette.lock().unregister(session_id);
    drop(channel);
    if let Err(err) = writer.await {
        debug!(session_id = %session_id, error = %err, "writer task ended abnormally");
    }
    info!(session_id = %session_id, "websocket disconnected");
}
