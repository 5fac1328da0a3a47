//! Shared primitives for the tidepool shared-grid service: the fixed index
//! domain, chunk partitioning, the bit-chunked toggle set and the JSON wire
//! protocol spoken between the server and its clients.

pub mod chunk;
pub mod domain;
pub mod protocol;
pub mod toggle_set;

pub use chunk::ChunkPartitioner;
pub use domain::{CellIndex, Domain, DomainError};
pub use protocol::{
    chat_len, ChatBroadcast, CheckboxChunk, CheckboxUpdate, ClientMessage, InitialState,
    ProtocolError, ServerMessage, DEFAULT_MAX_CHAT_LEN,
};
pub use toggle_set::{ToggleOutcome, ToggleSet};
