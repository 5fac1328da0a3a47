//! Connection table: one entry per live WebSocket, holding its display label
//! and the bounded queue feeding its writer task.

use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use metrics::counter;
use rand::Rng;
use slab::Slab;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;
use uuid::Uuid;

const DEFAULT_CHANNEL_DEPTH: usize = 256;
const LABEL_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LABEL_LEN: usize = 4;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub per_connection_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    config: SessionConfig,
    connections: parking_lot::RwLock<Slab<ConnectionEntry>>,
    index: DashMap<ConnectionId, usize>,
}

struct ConnectionEntry {
    id: ConnectionId,
    label: String,
    sender: mpsc::Sender<Message>,
}

pub struct SessionRegistration {
    pub connection_id: ConnectionId,
    pub label: String,
    pub receiver: mpsc::Receiver<Message>,
    pub active_connections: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMetrics {
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub label: String,
}

enum Failure {
    Full,
    Closed,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                config,
                connections: parking_lot::RwLock::new(Slab::new()),
                index: DashMap::new(),
            }),
        }
    }

    /// Inserts a new connection with a fresh identity and label.
    pub fn register(&self) -> SessionRegistration {
        let (tx, rx) = mpsc::channel(self.inner.config.per_connection_buffer.max(1));
        let connection_id = Uuid::new_v4();
        let label = generate_label();

        let mut connections = self.inner.connections.write();
        let key = connections.insert(ConnectionEntry {
            id: connection_id,
            label: label.clone(),
            sender: tx,
        });
        self.inner.index.insert(connection_id, key);

        SessionRegistration {
            connection_id,
            label,
            receiver: rx,
            active_connections: connections.len(),
        }
    }

    /// Removes a connection; returns the number still registered. Unknown ids
    /// (already evicted) are ignored.
    pub fn unregister(&self, connection_id: ConnectionId) -> usize {
        let mut connections = self.inner.connections.write();
        if let Some((_, key)) = self.inner.index.remove(&connection_id) {
            if connections.get(key).is_some_and(|e| e.id == connection_id) {
                connections.remove(key);
            }
        }
        connections.len()
    }

    pub fn label(&self, connection_id: ConnectionId) -> Option<String> {
        let key = *self.inner.index.get(&connection_id)?;
        self.inner
            .connections
            .read()
            .get(key)
            .filter(|e| e.id == connection_id)
            .map(|e| e.label.clone())
    }

    pub fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.inner.index.contains_key(&connection_id)
    }

    pub fn active_connections(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Queues `message` for one connection. Returns `false` when the
    /// connection is gone or was evicted for falling behind.
    pub fn send_to(&self, connection_id: ConnectionId, message: Message) -> bool {
        let sender = {
            let Some(key) = self.inner.index.get(&connection_id).map(|k| *k) else {
                return false;
            };
            let connections = self.inner.connections.read();
            match connections.get(key).filter(|e| e.id == connection_id) {
                Some(entry) => entry.sender.clone(),
                None => return false,
            }
        };

        match sender.try_send(message) {
            Ok(()) => true,
            Err(err) => {
                let failure = match err {
                    TrySendError::Full(_) => Failure::Full,
                    TrySendError::Closed(_) => Failure::Closed,
                };
                self.evict(&[(connection_id, failure)]);
                false
            }
        }
    }

    /// Queues `message` for every connection except `exclude`. Never waits on
    /// a slow connection: a full queue evicts it instead.
    pub fn broadcast(&self, message: &Message, exclude: Option<ConnectionId>) -> BroadcastMetrics {
        let mut metrics = BroadcastMetrics::default();
        let mut failed = Vec::new();
        {
            let connections = self.inner.connections.read();
            for (_, entry) in connections.iter() {
                if Some(entry.id) == exclude {
                    continue;
                }
                match entry.sender.try_send(message.clone()) {
                    Ok(()) => metrics.delivered += 1,
                    Err(TrySendError::Full(_)) => failed.push((entry.id, Failure::Full)),
                    Err(TrySendError::Closed(_)) => failed.push((entry.id, Failure::Closed)),
                }
            }
        }
        metrics.evicted = failed.len();
        if !failed.is_empty() {
            self.evict(&failed);
        }
        metrics
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.inner
            .connections
            .read()
            .iter()
            .map(|(_, e)| SessionSnapshot {
                connection_id: e.id,
                label: e.label.clone(),
            })
            .collect()
    }

    /// Dropping the entry drops the queue's only sender, so the writer task
    /// drains what is buffered and then closes the socket.
    fn evict(&self, failed: &[(ConnectionId, Failure)]) {
        let mut connections = self.inner.connections.write();
        for (connection_id, failure) in failed {
            let Some((_, key)) = self.inner.index.remove(connection_id) else {
                continue;
            };
            if connections.get(key).is_some_and(|e| e.id == *connection_id) {
                connections.remove(key);
            }
            if matches!(failure, Failure::Full) {
                counter!("tidepool_slow_consumer_evictions_total").increment(1);
                warn!(connection_id = %connection_id, "evicting slow consumer");
            }
        }
    }
}

fn generate_label() -> String {
    let mut rng = rand::thread_rng();
    (0..LABEL_LEN)
        .map(|_| LABEL_ALPHABET[rng.gen_range(0..LABEL_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(body: &str) -> Message {
        Message::Text(body.to_string())
    }

    #[test_timeout::timeout]
    fn register_assigns_distinct_ids_and_labels() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a.connection_id, b.connection_id);
        assert_eq!(a.label.len(), 4);
        assert!(a.label.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert_eq!(b.active_connections, 2);
        assert_eq!(registry.label(a.connection_id), Some(a.label.clone()));
    }

    #[test_timeout::timeout]
    fn unregister_removes_only_that_session() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let a = registry.register();
        let b = registry.register();
        assert_eq!(registry.unregister(a.connection_id), 1);
        assert!(registry.label(a.connection_id).is_none());
        assert!(registry.is_registered(b.connection_id));
        assert_eq!(registry.unregister(a.connection_id), 1);
    }

    #[test_timeout::timeout]
    fn broadcast_skips_excluded_connection() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let mut a = registry.register();
        let mut b = registry.register();
        let metrics = registry.broadcast(&text("hello"), Some(a.connection_id));
        assert_eq!(metrics.delivered, 1);
        assert!(a.receiver.try_recv().is_err());
        assert_eq!(b.receiver.try_recv().unwrap(), text("hello"));
    }

    #[test_timeout::timeout]
    fn full_queue_evicts_the_slow_connection() {
        let registry = SessionRegistry::new(SessionConfig {
            per_connection_buffer: 2,
        });
        let mut slow = registry.register();
        let mut fast = registry.register();

        for round in 0..3 {
            registry.broadcast(&text(&round.to_string()), None);
            while fast.receiver.try_recv().is_ok() {}
        }

        assert!(!registry.is_registered(slow.connection_id));
        assert!(registry.is_registered(fast.connection_id));
        assert_eq!(registry.active_connections(), 1);

        // The buffered backlog is still delivered, then the queue reports closed.
        assert_eq!(slow.receiver.try_recv().unwrap(), text("0"));
        assert_eq!(slow.receiver.try_recv().unwrap(), text("1"));
        assert!(matches!(
            slow.receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test_timeout::timeout]
    fn send_to_unknown_connection_is_refused() {
        let registry = SessionRegistry::new(SessionConfig::default());
        assert!(!registry.send_to(Uuid::new_v4(), text("nobody")));
    }
}
