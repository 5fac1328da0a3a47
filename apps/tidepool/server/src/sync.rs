//! Per-connection WebSocket loop.
//!
//! Each socket gets a writer task draining its registry queue and a reader
//! loop decoding client frames. When the registry drops the queue (the client
//! disconnected or fell too far behind), the writer flushes what is buffered
//! and closes the socket.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tidepool_core::ClientMessage;
use tracing::{debug, info, warn};

use crate::AppState;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, peer))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, peer: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let registration = state.registry.register();
    let connection_id = registration.connection_id;
    let mut rx = registration.receiver;
    counter!("tidepool_connections_total").increment(1);
    gauge!("tidepool_connections_active").set(registration.active_connections as f64);
    info!(
        connection_id = %connection_id,
        label = %registration.label,
        peer = %peer,
        active = registration.active_connections,
        "connection established"
    );

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                return;
            }
        }
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "slow consumer".into(),
            })))
            .await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => {
                debug!(connection_id = %connection_id, "writer finished; dropping connection");
                break;
            }
            frame = ws_rx.next() => {
                let message = match frame {
                    Some(Ok(Message::Text(text))) => ClientMessage::decode(&text),
                    Some(Ok(Message::Binary(bytes))) => ClientMessage::decode_bytes(&bytes),
                    Some(Ok(Message::Close(frame))) => {
                        info!(
                            connection_id = %connection_id,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "client closed websocket"
                        );
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(connection_id = %connection_id, error = %err, "error receiving message");
                        break;
                    }
                    None => break,
                };
                match message {
                    Ok(message) => state.handle_client_message(connection_id, message),
                    Err(err) => {
                        counter!("tidepool_malformed_messages_total").increment(1);
                        warn!(connection_id = %connection_id, error = %err, "ignoring malformed frame");
                    }
                }
            }
        }
    }

    let active = state.registry.unregister(connection_id);
    writer.abort();
    counter!("tidepool_connections_closed_total").increment(1);
    gauge!("tidepool_connections_active").set(active as f64);
    info!(connection_id = %connection_id, active, "connection closed");
}
