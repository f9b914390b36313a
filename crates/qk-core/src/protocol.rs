//! Wire protocol for the QUIK terminal link.
//!
//! Both channels speak the same framing: newline-delimited UTF-8 text, one
//! JSON object per line, plus the bare keepalive tokens `ping`/`pong` and the
//! courtesy token `quit` sent before closing. Requests carry a numeric `id`
//! and the `clientId` of the issuing connection; responses echo the `id`.
//! Unsolicited events carry a `callback` field instead and are only ever
//! pushed on the event (CB) channel.

use std::fmt;

use serde_json::{Value, json};

use crate::error::QuikError;

/// A decoded JSON frame as received from or sent to the terminal.
pub type Frame = Value;

/// Keepalive probe sent on both channels.
pub const PING: &str = "ping";
/// Keepalive reply; arrives as a bare line, not JSON.
pub const PONG: &str = "pong";
/// Courtesy token sent to the peer before a socket is closed.
pub const QUIT: &str = "quit";

/// The two sockets the terminal exposes.
///
/// `Mn` is the request channel (script/function execution); `Cb` is the event
/// channel (subscriptions and pushed events). Responses to requests may
/// arrive on either, matched by `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Mn,
    Cb,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Mn => write!(f, "MN"),
            Channel::Cb => write!(f, "CB"),
        }
    }
}

/// The payload half of an outgoing request envelope.
#[derive(Debug, Clone)]
pub enum RequestBody<'a> {
    /// A raw QLua chunk evaluated remotely.
    Chunk(&'a str),
    /// A named function call with a JSON-array argument list.
    Function { fname: &'a str, args: &'a Value },
    /// An event subscription: callback name plus filter expression (CB only).
    Callback { callback: &'a str, filter: &'a str },
}

/// Serializes a request envelope to its single-line JSON form.
pub fn encode_request(id: u64, client_id: &str, body: &RequestBody<'_>) -> String {
    let envelope = match body {
        RequestBody::Chunk(chunk) => json!({
            "id": id,
            "clientId": client_id,
            "chunk": chunk,
        }),
        RequestBody::Function { fname, args } => json!({
            "id": id,
            "clientId": client_id,
            "fname": fname,
            "args": args,
        }),
        RequestBody::Callback { callback, filter } => json!({
            "id": id,
            "clientId": client_id,
            "callback": callback,
            "filter": filter,
        }),
    };
    envelope.to_string()
}

/// One classified incoming line.
#[derive(Debug)]
pub enum Incoming {
    /// Bare `pong` keepalive reply.
    Pong,
    /// A response frame correlated by `id`.
    Reply { id: u64, frame: Frame },
    /// An unsolicited event frame (`callback` field, no `id`).
    Callback(Frame),
}

/// Classifies one received line.
///
/// A frame must be a JSON object carrying either a non-negative integer `id`
/// or a `callback` field; anything else is a protocol error the caller
/// reports and drops without tearing the channel down.
pub fn decode_line(line: &str) -> Result<Incoming, QuikError> {
    if line == PONG {
        return Ok(Incoming::Pong);
    }
    let value: Value = serde_json::from_str(line)
        .map_err(|e| QuikError::Protocol(format!("invalid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| QuikError::Protocol(format!("frame is not an object: {value}")))?;
    if let Some(id_value) = object.get("id") {
        let id = id_value
            .as_u64()
            .ok_or_else(|| QuikError::Protocol(format!("non-integer id: {id_value}")))?;
        return Ok(Incoming::Reply { id, frame: value });
    }
    if object.contains_key("callback") {
        return Ok(Incoming::Callback(value));
    }
    Err(QuikError::Protocol(format!(
        "frame has neither id nor callback: {value}"
    )))
}
