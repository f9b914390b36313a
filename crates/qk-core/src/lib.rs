//! # qk-core
//!
//! Core crate for the QUIK terminal bridge, providing:
//!
//! - **Transport** (`transport`) — newline-framed TCP socket with a non-blocking receive poll
//! - **Protocol** (`protocol`) — request envelopes, frame classification, keepalive tokens
//! - **Connection** (`connect`) — the dual-channel (MN/CB) connection and its background loop
//! - **Correlation** (`pending`) — request IDs and the pending-reply table
//! - **Listeners** (`listener`) — connection events and the single-task dispatch loop
//! - **Readiness** (`status`) — the "terminal is connected to the trading server" signal
//! - **Decoding** (`decoder`) — response-frame accessors and timestamp parsing
//! - **Configuration** (`config`) — JSON config deserialization
//! - **Error types** (`error`) — domain-specific `QuikError` via thiserror
//! - **Time utilities** (`time_util`) — epoch-millisecond timestamps
//! - **Logging** (`logging`) — tracing-based structured logging

pub mod config;
pub mod connect;
pub mod decoder;
pub mod error;
pub mod listener;
pub mod logging;
pub mod pending;
pub mod protocol;
pub mod status;
pub mod time_util;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connect::{LinkState, QuikConnect};
pub use error::QuikError;
pub use listener::{QuikEvent, QuikListener};
pub use pending::PendingReply;
pub use protocol::{Channel, Frame};
pub use status::{ServerConnectionStatus, StatusHandle};
