//! Typed error definitions for the QUIK bridge.
//!
//! Provides [`QuikError`] for domain-specific errors that are more informative
//! than plain `anyhow::Error` strings. All variants implement `std::error::Error`
//! via `thiserror`, so they integrate seamlessly with `anyhow::Result`.

use thiserror::Error;

use crate::protocol::Channel;

/// Domain-specific errors for the QUIK bridge.
#[derive(Debug, Error)]
pub enum QuikError {
    /// Socket-level failure on open, send, or receive.
    #[error("i/o error on the {channel} channel: {source}")]
    Io {
        channel: Channel,
        #[source]
        source: std::io::Error,
    },

    /// The target channel is errored or not open; the request was not sent.
    #[error("the {0} channel is down")]
    ChannelDown(Channel),

    /// No matching response arrived before the caller-supplied deadline.
    #[error("request {id} timed out after {timeout_ms} ms")]
    Timeout { id: u64, timeout_ms: u64 },

    /// The connection shut down while the request was still in flight.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    /// A received line is not valid JSON or not a recognized frame shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-formed response with `status == false`; carries the peer's `err` text.
    #[error("terminal reported an error: {0}")]
    Terminal(String),

    /// A timestamp string with an unexpected length or a non-digit where a digit belongs.
    #[error("illegal timestamp: {0}")]
    Timestamp(String),
}
