//! WebSocket link to the server with automatic reconnection.
//!
//! The link runs as a background task and reports [`ConnectionEvent`]s. Any
//! message queued while offline is dropped on reconnect: the reactor rebuilds
//! its view from a fresh `get-initial-state` instead.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tidepool_core::{ClientMessage, ProtocolError, ServerMessage};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Message(ServerMessage),
    Disconnected { reason: String },
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server closed the connection{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed(Option<String>),
    #[error("client is shutting down")]
    Shutdown,
}

/// Exponential reconnect delay: starts at `initial`, doubles per failure,
/// capped at `max`, reset after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(5))
    }
}

pub struct Connection {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::Receiver<ConnectionEvent>,
    task: JoinHandle<()>,
}

impl Connection {
    pub fn spawn(url: String, backoff: Backoff) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let task = tokio::spawn(run_link(url, backoff, outgoing_rx, events_tx));
        Self {
            outgoing,
            events,
            task,
        }
    }

    /// Queues a message for the current connection. Returns `false` once the
    /// link task has stopped.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.outgoing.send(message).is_ok()
    }

    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_link(
    url: String,
    mut backoff: Backoff,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!(url = %url, "websocket connected");
                backoff.reset();
                while outgoing.try_recv().is_ok() {}
                if events.send(ConnectionEvent::Connected).await.is_err() {
                    return;
                }
                let err = pump(socket, &mut outgoing, &events).await;
                if matches!(err, ConnectionError::Shutdown) {
                    return;
                }
                warn!(error = %err, "websocket disconnected");
                let event = ConnectionEvent::Disconnected {
                    reason: err.to_string(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!(url = %url, error = %err, "connect attempt failed");
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = events.closed() => return,
        }
    }
}

/// Shuttles frames until the socket fails; always ends with the reason.
async fn pump(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outgoing: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::Sender<ConnectionEvent>,
) -> ConnectionError {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else {
                    let _ = sink.close().await;
                    return ConnectionError::Shutdown;
                };
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => return err.into(),
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    return err.into();
                }
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("ignoring non UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return ConnectionError::Closed(frame.map(|f| f.reason.into_owned()));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return err.into(),
                    None => return ConnectionError::Closed(None),
                };
                match ServerMessage::decode(&text) {
                    Ok(message) => {
                        if events.send(ConnectionEvent::Message(message)).await.is_err() {
                            return ConnectionError::Shutdown;
                        }
                    }
                    Err(err) => warn!(error = %err, bytes = text.len(), "ignoring malformed server frame"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![250, 500, 1_000, 2_000, 4_000, 5_000, 5_000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test_timeout::timeout]
    fn close_reason_is_reported() {
        let err = ConnectionError::Closed(Some("slow consumer".into()));
        assert_eq!(err.to_string(), "server closed the connection: slow consumer");
        assert_eq!(
            ConnectionError::Closed(None).to_string(),
            "server closed the connection"
        );
    }
}
