//! Client-side state machine.
//!
//! `GridClient` owns the layout, viewport, renderer and local mirror, reacts
//! to server messages and frame ticks, and queues outgoing protocol messages
//! in an outbox that the I/O loop drains. It performs no I/O itself, so every
//! reaction runs to completion without awaiting anything.

use std::{
    collections::{HashSet, VecDeque},
    time::{Duration, Instant},
};

use thiserror::Error;
use tidepool_core::{
    CellIndex, CheckboxChunk, CheckboxUpdate, ChunkPartitioner, ClientMessage, Domain, DomainError,
    InitialState, ServerMessage,
};
use tracing::{debug, info, warn};

use crate::{
    chat::{prepare_outgoing, ChatInputError, ChatLog, SELF_LABEL},
    connection::ConnectionEvent,
    layout::{GridLayout, GridMetrics},
    mirror::LocalMirror,
    renderer::{CellHost, IncrementalRenderer, RenderProgress},
    viewport::{ViewportConfig, ViewportTracker},
};

pub const HIGHLIGHT_DURATION: Duration = Duration::from_secs(2);
const COMPLETION_NOTICE: &str = "Every cell is checked!";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Domain size assumed until the server reports its own.
    pub expected_domain_size: u64,
    pub chunk_size: u64,
    pub render_batch: usize,
    pub viewport: ViewportConfig,
    pub metrics: GridMetrics,
    pub max_chat_len: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JumpError {
    #[error("'{0}' is not a cell number")]
    NotANumber(String),
    #[error("Please enter a number between 1 and {max}")]
    OutOfRange { max: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Highlight {
    index: CellIndex,
    /// Set once the target is materialized.
    expires_at: Option<Instant>,
}

pub struct GridClient<H> {
    config: ClientConfig,
    partitioner: ChunkPartitioner,
    layout: GridLayout,
    viewport: ViewportTracker,
    renderer: IncrementalRenderer<H>,
    mirror: LocalMirror,
    chat: ChatLog,
    outbox: VecDeque<ClientMessage>,
    loaded_chunks: HashSet<u64>,
    connected: bool,
    synced: bool,
    highlight: Option<Highlight>,
    status: Option<String>,
}

impl<H: CellHost> GridClient<H> {
    pub fn new(
        config: ClientConfig,
        host: H,
        container_width: u32,
        viewport_height: u32,
    ) -> Result<Self, DomainError> {
        let domain = Domain::new(config.expected_domain_size)?;
        let partitioner = ChunkPartitioner::new(domain, config.chunk_size)?;
        let layout = GridLayout::new(config.metrics, domain.size(), container_width);
        let mut viewport = ViewportTracker::new(config.viewport);
        viewport.on_resize(viewport_height, layout.total_rows());
        Ok(Self {
            renderer: IncrementalRenderer::new(host, config.render_batch),
            mirror: LocalMirror::new(domain),
            config,
            partitioner,
            layout,
            viewport,
            chat: ChatLog::default(),
            outbox: VecDeque::new(),
            loaded_chunks: HashSet::new(),
            connected: false,
            synced: false,
            highlight: None,
            status: None,
        })
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn viewport(&self) -> &ViewportTracker {
        &self.viewport
    }

    pub fn renderer(&self) -> &IncrementalRenderer<H> {
        &self.renderer
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn max_chat_len(&self) -> usize {
        self.config.max_chat_len
    }

    /// Cell currently highlighted after a jump, if its highlight is running.
    pub fn highlighted(&self) -> Option<CellIndex> {
        self.highlight
            .filter(|h| h.expires_at.is_some())
            .map(|h| h.index)
    }

    pub fn drain_outbox(&mut self) -> impl Iterator<Item = ClientMessage> + '_ {
        self.outbox.drain(..)
    }

    pub fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_connected(),
            ConnectionEvent::Message(message) => self.on_server_message(message),
            ConnectionEvent::Disconnected { reason } => self.on_disconnected(&reason),
        }
    }

    /// Every (re)connection starts from scratch: fresh initial state, and
    /// every chunk in view is fetched again once it arrives.
    pub fn on_connected(&mut self) {
        info!("connected; requesting initial state");
        self.connected = true;
        self.synced = false;
        self.loaded_chunks.clear();
        self.outbox.clear();
        self.outbox.push_back(ClientMessage::GetInitialState);
        self.status = None;
    }

    pub fn on_disconnected(&mut self, reason: &str) {
        warn!(reason, "connection lost");
        self.connected = false;
        self.synced = false;
        self.outbox.clear();
        self.status = Some(format!("Disconnected ({reason}); reconnecting..."));
    }

    pub fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::InitialState(state) => self.apply_initial_state(state),
            ServerMessage::CheckboxChunk(chunk) => self.apply_chunk(chunk),
            ServerMessage::CheckboxUpdate(update) => self.apply_update(update),
            ServerMessage::ChatMessage(chat) => self.chat.push_message(chat.user_id, chat.message),
            ServerMessage::ChatError(error) => self.chat.push_notice(error),
        }
        if self.mirror.take_completion() {
            self.chat.push_notice(COMPLETION_NOTICE);
            self.status = Some(COMPLETION_NOTICE.to_string());
        }
    }

    fn apply_initial_state(&mut self, state: InitialState) {
        if state.domain_size != self.mirror.domain().size() {
            warn!(
                expected = self.mirror.domain().size(),
                reported = state.domain_size,
                "server domain size differs; adopting server value"
            );
            if let Err(err) = self.adopt_domain(state.domain_size) {
                warn!(error = %err, "ignoring unusable domain size from server");
                return;
            }
        }
        self.mirror.set_total_checked(state.count_true);
        self.synced = true;

        match state.checked_boxes {
            Some(checked) => {
                let size = self.mirror.domain().size();
                self.mirror.apply_chunk(0..size, &checked);
                self.loaded_chunks.extend(0..self.partitioner.chunk_count());
            }
            None => self.request_missing_chunks(),
        }
        let mirror = &self.mirror;
        self.renderer
            .reconcile_range(0..mirror.domain().size(), |i| mirror.is_checked(i));
    }

    fn adopt_domain(&mut self, size: u64) -> Result<(), DomainError> {
        let domain = Domain::new(size)?;
        self.partitioner = ChunkPartitioner::new(domain, self.config.chunk_size)?;
        self.mirror.reset_domain(domain);
        self.layout.set_domain_size(size);
        self.viewport
            .on_resize(self.viewport.viewport_height(), self.layout.total_rows());
        self.viewport.invalidate();
        self.renderer.clear();
        self.loaded_chunks.clear();
        Ok(())
    }

    fn apply_chunk(&mut self, chunk: CheckboxChunk) {
        let range = self.partitioner.range_of_raw(chunk.chunk_index);
        if range.is_empty() {
            debug!(chunk_index = chunk.chunk_index, "ignoring chunk outside the domain");
            return;
        }
        let changed = self.mirror.apply_chunk(range.clone(), &chunk.checked_boxes);
        debug!(
            chunk_index = chunk.chunk_index,
            true_indices = chunk.checked_boxes.len(),
            changed,
            "applied chunk"
        );
        let mirror = &self.mirror;
        self.renderer.reconcile_range(range, |i| mirror.is_checked(i));
    }

    fn apply_update(&mut self, update: CheckboxUpdate) {
        let index = match self.mirror.domain().check(update.index) {
            Ok(index) => index,
            Err(err) => {
                warn!(error = %err, "ignoring update outside the domain");
                return;
            }
        };
        self.mirror
            .apply_remote(index, update.checked, update.total_checked);
        self.renderer.reconcile(index, update.checked);
    }

    /// One display refresh: fold pending scroll/resize into a new window,
    /// fetch chunks it needs, and create one batch of widgets.
    pub fn on_frame(&mut self, now: Instant) -> RenderProgress {
        if let Some(window) = self.viewport.on_frame() {
            let range = window.index_range(self.layout.columns(), self.layout.domain_size());
            debug!(start = range.start, end = range.end, "render range changed");
            self.renderer.set_range(range);
            self.request_missing_chunks();
        }

        let mirror = &self.mirror;
        let progress = self.renderer.run_batch(|i| mirror.is_checked(i));

        self.highlight = match self.highlight {
            Some(Highlight {
                index,
                expires_at: None,
            }) if self.renderer.is_materialized(index) => Some(Highlight {
                index,
                expires_at: Some(now + HIGHLIGHT_DURATION),
            }),
            Some(Highlight {
                expires_at: Some(expires_at),
                ..
            }) if now >= expires_at => None,
            other => other,
        };
        progress
    }

    fn request_missing_chunks(&mut self) {
        if !self.connected || !self.synced {
            return;
        }
        for chunk in self.partitioner.chunks_covering(self.renderer.range()) {
            if self.loaded_chunks.insert(chunk) {
                debug!(chunk_index = chunk, "requesting chunk");
                self.outbox
                    .push_back(ClientMessage::RequestCheckboxChunk(
                        i64::try_from(chunk).unwrap_or(i64::MAX),
                    ));
            }
        }
    }

    /// Flips a cell optimistically and asks the server to do the same.
    /// Returns `false` when offline or the index is outside the grid.
    pub fn toggle(&mut self, index: CellIndex) -> bool {
        if !self.connected {
            self.status = Some("Not connected; toggle ignored".to_string());
            return false;
        }
        let checked = !self.mirror.is_checked(index);
        if let Err(err) = self.mirror.apply_local(index, checked) {
            warn!(error = %err, "refusing local toggle");
            return false;
        }
        self.renderer.reconcile(index, checked);
        self.outbox
            .push_back(ClientMessage::CheckboxUpdate(CheckboxUpdate::request(index, checked)));
        if self.mirror.take_completion() {
            self.chat.push_notice(COMPLETION_NOTICE);
            self.status = Some(COMPLETION_NOTICE.to_string());
        }
        true
    }

    /// Scrolls so the 1-based cell `input` sits in the top row and
    /// highlights it once it is on screen.
    pub fn jump_to(&mut self, input: &str) -> Result<CellIndex, JumpError> {
        let max = self.layout.domain_size();
        let result = match input.trim().parse::<u64>() {
            Ok(n) if (1..=max).contains(&n) => Ok(n - 1),
            Ok(_) => Err(JumpError::OutOfRange { max }),
            Err(_) if input.trim().starts_with('-') => Err(JumpError::OutOfRange { max }),
            Err(_) => Err(JumpError::NotANumber(input.trim().to_string())),
        };
        match result {
            Ok(index) => {
                let row = self.layout.row_of(index);
                self.viewport.on_scroll(self.layout.offset_of_row(row));
                self.highlight = Some(Highlight {
                    index,
                    expires_at: None,
                });
                self.status = None;
                Ok(index)
            }
            Err(err) => {
                self.status = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn send_chat(&mut self, input: &str) -> Result<(), ChatInputError> {
        let text = match prepare_outgoing(input, self.config.max_chat_len) {
            Ok(text) => text,
            Err(err) => {
                if matches!(err, ChatInputError::TooLong { .. }) {
                    self.chat.push_notice(err.to_string());
                }
                return Err(err);
            }
        };
        self.chat.push_message(SELF_LABEL, text.clone());
        self.outbox.push_back(ClientMessage::ChatMessage(text));
        Ok(())
    }

    pub fn scroll_rows(&mut self, delta: i64) {
        self.viewport.scroll_rows(delta);
    }

    pub fn scroll_pages(&mut self, delta: i64) {
        let page = self.viewport.visible_rows().max(1) as i64;
        self.viewport.scroll_rows(delta.saturating_mul(page));
    }

    pub fn scroll_to_top(&mut self) {
        self.viewport.on_scroll(0);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.viewport.on_scroll(self.viewport.max_scroll_offset());
    }

    /// Keeps `index` inside the visible rows, scrolling as little as possible.
    pub fn ensure_visible(&mut self, index: CellIndex) {
        let row = self.layout.row_of(index);
        let first = self.viewport.first_visible_row();
        let visible = self.viewport.visible_rows().max(1);
        if row < first {
            self.viewport.on_scroll(self.layout.offset_of_row(row));
        } else if row >= first + visible {
            self.viewport
                .on_scroll(self.layout.offset_of_row(row + 1 - visible));
        }
    }

    pub fn resize(&mut self, container_width: u32, viewport_height: u32) {
        if self.layout.resize(container_width) {
            // Same rows can now cover different indices.
            debug!(columns = self.layout.columns(), "column count changed");
            self.viewport.invalidate();
        }
        self.viewport
            .on_resize(viewport_height, self.layout.total_rows());
    }
}
