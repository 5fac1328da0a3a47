//! Terminal client for the tidepool shared grid.
//!
//! Everything below `app` is UI-agnostic: the viewport tracker decides which
//! rows matter, the incremental renderer keeps exactly those cells alive, and
//! the reactor keeps the local mirror in step with the server.

pub mod app;
pub mod chat;
pub mod config;
pub mod connection;
pub mod layout;
pub mod logging;
pub mod mirror;
pub mod reactor;
pub mod renderer;
pub mod scheduler;
pub mod viewport;

pub use connection::{Backoff, Connection, ConnectionError, ConnectionEvent};
pub use reactor::{ClientConfig, GridClient, JumpError};
pub use renderer::{CellHost, IncrementalRenderer, RenderProgress};
pub use viewport::{ViewportConfig, ViewportTracker, ViewportWindow};
