//! WebSocket transport edge.
//!
//! One task per direction for every connection: the read loop feeds inbound
//! payloads into the relay, the write loop drains the fan-out channel onto
//! the socket. A connection that cannot keep up (lagged fan-out queue, or a
//! send stalled past the configured budget) is dropped without holding up
//! anyone else.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use crate::api::AppState;
use crate::relay::{ConnectionId, Frame, Payload, Relay};

/// Close code sent when the relay refuses a connection (Try Again Later)
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one WebSocket connection from upgrade to teardown.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let session = match state.relay.accept().await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Refusing WebSocket connection: {}", e);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TRY_AGAIN_LATER,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let conn_id = session.id;
    let (sender, receiver) = socket.split();

    let mut send_task = tokio::spawn(write_loop(
        sender,
        conn_id,
        session.frames,
        session.shutdown,
        state.send_timeout,
    ));
    let mut recv_task = tokio::spawn(read_loop(receiver, conn_id, state.relay.clone()));

    // Whichever direction finishes first tears down the other. Both paths
    // funnel into the same disconnect below, which is idempotent.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.relay.disconnect(conn_id).await;
}

/// Drain the fan-out channel onto the socket until the peer goes away,
/// falls behind, or the relay shuts down.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    conn_id: ConnectionId,
    mut frames: broadcast::Receiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
    send_timeout: Duration,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                // A sender never hears its own message back
                Ok(frame) if frame.sender == conn_id => continue,
                Ok(frame) => {
                    match tokio::time::timeout(send_timeout, sender.send(to_ws_message(frame.payload))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::debug!(connection = %conn_id, "Send failed: {}", e);
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(
                                connection = %conn_id,
                                timeout_secs = send_timeout.as_secs(),
                                "Receiver stalled past send budget, dropping connection"
                            );
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        connection = %conn_id,
                        skipped,
                        "Slow receiver fell behind fan-out queue, dropping connection"
                    );
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => {
                // Proactive close on relay shutdown; best effort
                let _ = tokio::time::timeout(send_timeout, sender.send(Message::Close(None))).await;
                break;
            }
        }
    }
}

/// Feed inbound payloads into the relay until the peer closes or errors.
async fn read_loop(mut receiver: SplitStream<WebSocket>, conn_id: ConnectionId, relay: Arc<Relay>) {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                relay.publish(conn_id, Payload::Text(text)).await;
            }
            Ok(Message::Binary(bytes)) => {
                relay.publish(conn_id, Payload::Binary(bytes)).await;
            }
            // axum answers pings on its own; pongs carry no work
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                // Protocol error on this connection only; others unaffected
                tracing::debug!(connection = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }
}

fn to_ws_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::Text(text),
        Payload::Binary(bytes) => Message::Binary(bytes),
    }
}
