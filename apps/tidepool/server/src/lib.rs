pub mod config;
pub mod session;
pub mod store;
pub mod sync;
pub mod telemetry;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{ws::Message, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tidepool_core::{chat_len, ChatBroadcast, CheckboxUpdate, ClientMessage, ServerMessage};
use tokio::{net::TcpListener, signal};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    session::{ConnectionId, SessionRegistry},
    store::GridStore,
};

pub struct AppState {
    pub config: ServerConfig,
    pub store: GridStore,
    pub registry: SessionRegistry,
    metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    domain_size: u64,
    chunk_size: u64,
    count_true: u64,
    active_connections: usize,
    sessions: Vec<SessionStatsEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatsEntry {
    connection_id: String,
    label: String,
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        let store = GridStore::new(config.partitioner, config.ships_inline_snapshot());
        let registry = SessionRegistry::new(config.session.clone());
        Self {
            config,
            store,
            registry,
            metrics,
        }
    }

    /// Applies one decoded client message. Replies and broadcasts are queued
    /// without waiting on any socket. Snapshots are queued under the store
    /// lock, like toggle echoes, so a reply never overtakes an echo.
    pub fn handle_client_message(&self, connection_id: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::GetInitialState => {
                self.store.initial_state_with(|state| {
                    self.reply(connection_id, &ServerMessage::InitialState(state));
                });
            }
            ClientMessage::RequestCheckboxChunk(chunk_index) => {
                let true_indices = self.store.chunk_with(chunk_index, |chunk| {
                    let true_indices = chunk.checked_boxes.len();
                    self.reply(connection_id, &ServerMessage::CheckboxChunk(chunk));
                    true_indices
                });
                counter!("tidepool_chunk_requests_total").increment(1);
                histogram!("tidepool_chunk_response_indices").record(true_indices as f64);
                debug!(
                    connection_id = %connection_id,
                    chunk_index,
                    true_indices,
                    "serving chunk"
                );
            }
            ClientMessage::CheckboxUpdate(update) => self.apply_toggle(connection_id, update),
            ClientMessage::ChatMessage(text) => self.relay_chat(connection_id, text),
        }
    }

    fn apply_toggle(&self, connection_id: ConnectionId, update: CheckboxUpdate) {
        let result = self.store.toggle_with(update.index, update.checked, |outcome| {
            let echo = ServerMessage::CheckboxUpdate(CheckboxUpdate {
                index: outcome.index as i64,
                checked: outcome.checked,
                total_checked: Some(outcome.count_true),
            });
            // Fan-out happens under the store lock so every connection sees
            // toggles in the order they were applied.
            if let Some(frame) = encode(&echo) {
                self.registry.broadcast(&frame, None);
            }
            outcome.count_true
        });

        match result {
            Ok(count_true) => {
                counter!("tidepool_toggles_accepted_total").increment(1);
                gauge!("tidepool_cells_true").set(count_true as f64);
            }
            Err(err) => {
                counter!("tidepool_toggles_rejected_total").increment(1);
                warn!(connection_id = %connection_id, error = %err, "rejected toggle");
            }
        }
    }

    fn relay_chat(&self, connection_id: ConnectionId, text: String) {
        let max = self.config.max_chat_len;
        if chat_len(&text) > max {
            counter!("tidepool_chat_rejected_total").increment(1);
            let error =
                ServerMessage::ChatError(format!("Message exceeds maximum length of {max} characters"));
            self.reply(connection_id, &error);
            return;
        }
        let Some(user_id) = self.registry.label(connection_id) else {
            return;
        };
        counter!("tidepool_chat_messages_total").increment(1);
        let broadcast = ServerMessage::ChatMessage(ChatBroadcast {
            user_id,
            message: text,
        });
        if let Some(frame) = encode(&broadcast) {
            self.registry.broadcast(&frame, Some(connection_id));
        }
    }

    fn reply(&self, connection_id: ConnectionId, message: &ServerMessage) {
        if let Some(frame) = encode(message) {
            self.registry.send_to(connection_id, frame);
        }
    }

    fn stats(&self) -> StatsResponse {
        let sessions: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|entry| SessionStatsEntry {
                connection_id: entry.connection_id.to_string(),
                label: entry.label,
            })
            .collect();
        StatsResponse {
            domain_size: self.store.domain().size(),
            chunk_size: self.store.partitioner().chunk_size(),
            count_true: self.store.count_true(),
            active_connections: sessions.len(),
            sessions,
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Message> {
    match message.encode() {
        Ok(text) => Some(Message::Text(text)),
        Err(err) => {
            warn!(error = %err, "failed to encode server message");
            None
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(sync::ws_handler))
        .with_state(state)
}

/// Serves on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let listen_addr = config.listen_addr;
    let grace = config.shutdown_grace;
    let state = Arc::new(AppState::new(config, Some(metrics)));

    let listener = TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("tidepool listening on {}", listener.local_addr().unwrap_or(listen_addr));

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(ServerConfig::new(1_000, 100).unwrap(), None)
    }

    fn next(receiver: &mut tokio::sync::mpsc::Receiver<Message>) -> ServerMessage {
        match receiver.try_recv().expect("queued frame") {
            Message::Text(text) => ServerMessage::decode(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn toggle_echo_reaches_sender_with_total() {
        let state = state();
        let mut a = state.registry.register();
        let mut b = state.registry.register();
        state.handle_client_message(
            a.connection_id,
            ClientMessage::CheckboxUpdate(CheckboxUpdate::request(42, true)),
        );
        let expected = ServerMessage::CheckboxUpdate(CheckboxUpdate {
            index: 42,
            checked: true,
            total_checked: Some(1),
        });
        assert_eq!(next(&mut a.receiver), expected);
        assert_eq!(next(&mut b.receiver), expected);
    }

    #[test_timeout::timeout]
    fn out_of_range_toggle_is_silent() {
        let state = state();
        let mut a = state.registry.register();
        for index in [-1, 1_000] {
            state.handle_client_message(
                a.connection_id,
                ClientMessage::CheckboxUpdate(CheckboxUpdate {
                    index,
                    checked: true,
                    total_checked: None,
                }),
            );
        }
        assert!(a.receiver.try_recv().is_err());
        assert_eq!(state.store.count_true(), 0);
    }

    #[test_timeout::timeout]
    fn chat_goes_to_others_and_long_chat_errors_to_sender() {
        let state = state();
        let mut a = state.registry.register();
        let mut b = state.registry.register();

        state.handle_client_message(a.connection_id, ClientMessage::ChatMessage("hi".into()));
        assert!(a.receiver.try_recv().is_err());
        assert_eq!(
            next(&mut b.receiver),
            ServerMessage::ChatMessage(ChatBroadcast {
                user_id: a.label.clone(),
                message: "hi".into(),
            })
        );

        state.handle_client_message(a.connection_id, ClientMessage::ChatMessage("x".repeat(101)));
        assert_eq!(
            next(&mut a.receiver),
            ServerMessage::ChatError("Message exceeds maximum length of 100 characters".into())
        );
        assert!(b.receiver.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn snapshots_never_lag_behind_earlier_echoes() {
        const ROUNDS: usize = 20_000;
        let mut config = ServerConfig::new(1_000, 100).unwrap();
        config.session.per_connection_buffer = 4 * ROUNDS;
        let state = AppState::new(config, None);
        let writer = state.registry.register();
        let mut reader = state.registry.register();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..ROUNDS {
                    state.handle_client_message(
                        writer.connection_id,
                        ClientMessage::CheckboxUpdate(CheckboxUpdate::request(5, round % 2 == 0)),
                    );
                }
            });
            scope.spawn(|| {
                for round in 0..ROUNDS {
                    let request = if round % 2 == 0 {
                        ClientMessage::RequestCheckboxChunk(0)
                    } else {
                        ClientMessage::GetInitialState
                    };
                    state.handle_client_message(reader.connection_id, request);
                }
            });
        });

        // Replaying the reader's queue, every snapshot must agree with the
        // echo queued just before it.
        let mut checked = false;
        let mut replies = 0;
        let mut stale = 0;
        while let Ok(Message::Text(text)) = reader.receiver.try_recv() {
            match ServerMessage::decode(&text).unwrap() {
                ServerMessage::CheckboxUpdate(echo) => checked = echo.checked,
                ServerMessage::CheckboxChunk(chunk) => {
                    replies += 1;
                    if chunk.checked_boxes.contains(&5) != checked {
                        stale += 1;
                    }
                }
                ServerMessage::InitialState(initial) => {
                    replies += 1;
                    if initial.count_true != u64::from(checked) {
                        stale += 1;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(replies, ROUNDS);
        assert_eq!(stale, 0);
    }

    #[test_timeout::timeout]
    fn stats_reflect_grid_and_sessions() {
        let state = state();
        let a = state.registry.register();
        state.store.toggle(5, true).unwrap();
        let stats = state.stats();
        assert_eq!(stats.domain_size, 1_000);
        assert_eq!(stats.chunk_size, 100);
        assert_eq!(stats.count_true, 1);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.sessions[0].label, a.label);
    }
}
