use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tidepool_client::{
    layout::GridMetrics, Backoff, CellHost, ClientConfig, Connection, ConnectionEvent, GridClient,
    ViewportConfig,
};
use tidepool_core::{CheckboxChunk, ClientMessage, InitialState, ServerMessage};

/// Answers `get-initial-state` with the connection number as the count and
/// hangs up on the first connection right after answering.
async fn flaky_server() -> SocketAddr {
    async fn upgrade(State(seen): State<Arc<AtomicU64>>, ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(move |socket| session(socket, seen))
    }

    async fn session(socket: WebSocket, seen: Arc<AtomicU64>) {
        let number = seen.fetch_add(1, Ordering::SeqCst);
        let (mut tx, mut rx) = socket.split();
        while let Some(Ok(frame)) = rx.next().await {
            let Message::Text(text) = frame else { continue };
            let reply = match ClientMessage::decode(&text) {
                Ok(ClientMessage::GetInitialState) => ServerMessage::InitialState(InitialState {
                    count_true: number,
                    domain_size: 40,
                    checked_boxes: None,
                }),
                Ok(ClientMessage::RequestCheckboxChunk(chunk_index)) => {
                    ServerMessage::CheckboxChunk(CheckboxChunk {
                        chunk_index,
                        checked_boxes: if number == 0 { vec![] } else { vec![1] },
                    })
                }
                _ => continue,
            };
            if tx.send(Message::Text(reply.encode().unwrap())).await.is_err() {
                return;
            }
            if number == 0 && matches!(reply, ServerMessage::InitialState(_)) {
                let _ = tx.send(Message::Close(None)).await;
                return;
            }
        }
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new()
        .route("/ws", get(upgrade))
        .with_state(Arc::new(AtomicU64::new(0)));
    tokio::spawn(async move { axum::serve(listener, router).await });
    addr
}

async fn next_event(connection: &mut Connection) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), connection.recv())
        .await
        .expect("event before timeout")
        .expect("link running")
}

#[test_timeout::tokio_timeout_test]
async fn link_reconnects_after_server_hangs_up() {
    let addr = flaky_server().await;
    let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
    let mut connection = Connection::spawn(format!("ws://{addr}/ws"), backoff);

    assert_eq!(next_event(&mut connection).await, ConnectionEvent::Connected);
    assert!(connection.send(ClientMessage::GetInitialState));
    let ConnectionEvent::Message(ServerMessage::InitialState(first)) = next_event(&mut connection).await
    else {
        panic!("expected initial-state");
    };
    assert_eq!(first.count_true, 0);

    assert!(matches!(
        next_event(&mut connection).await,
        ConnectionEvent::Disconnected { .. }
    ));
    assert_eq!(next_event(&mut connection).await, ConnectionEvent::Connected);
    connection.send(ClientMessage::GetInitialState);
    let ConnectionEvent::Message(ServerMessage::InitialState(second)) = next_event(&mut connection).await
    else {
        panic!("expected initial-state");
    };
    assert_eq!(second.count_true, 1);
}

#[derive(Default)]
struct Cells(Vec<(u64, bool)>);

impl CellHost for Cells {
    fn create(&mut self, index: u64, checked: bool) {
        self.0.push((index, checked));
    }
    fn destroy(&mut self, _: u64) {}
    fn update(&mut self, index: u64, checked: bool) {
        self.0.push((index, checked));
    }
}

#[test_timeout::tokio_timeout_test]
async fn reactor_resyncs_chunks_after_reconnect() {
    let addr = flaky_server().await;
    let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
    let mut connection = Connection::spawn(format!("ws://{addr}/ws"), backoff);

    let config = ClientConfig {
        expected_domain_size: 40,
        chunk_size: 10,
        render_batch: 100,
        viewport: ViewportConfig {
            row_height: 1,
            buffer_rows: 0,
        },
        metrics: GridMetrics {
            cell_width: 1,
            row_height: 1,
            horizontal_padding: 0,
        },
        max_chat_len: 100,
    };
    // 10 columns, one visible row: rows 0..=1 are rendered, chunks 0 and 1.
    let mut client = GridClient::new(config, Cells::default(), 10, 1).unwrap();
    client.on_frame(Instant::now());

    while !(client.is_synced() && client.mirror().is_checked(1)) {
        let event = next_event(&mut connection).await;
        client.on_connection_event(event);
        client.on_frame(Instant::now());
        for message in client.drain_outbox() {
            connection.send(message);
        }
    }
    assert_eq!(client.mirror().total_checked(), 1);
    assert!(client.is_connected());
}
