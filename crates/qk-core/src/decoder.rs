//! Response-frame accessors and timestamp decoding.
//!
//! A response frame is `{"id": N, "status": bool, "result": ..., "err": ...}`.
//! The connection delivers such frames verbatim; consumers use the helpers
//! here to find out whether the call succeeded and to extract the payload.

use serde_json::Value;

use crate::error::QuikError;
use crate::protocol::Frame;

/// Whether the peer reports the call as successful.
///
/// Absent or non-boolean `status` counts as failure. Numeric `1`/`0` is
/// accepted because the terminal's scripting side is loose about booleans.
pub fn status(frame: &Frame) -> bool {
    match frame.get("status") {
        Some(Value::Bool(b)) => *b,
        Some(v) => v.as_i64().is_some_and(|n| n != 0),
        None => false,
    }
}

/// The peer's error text, when present.
pub fn err(frame: &Frame) -> Option<&str> {
    frame.get("err").and_then(Value::as_str)
}

/// The `result` payload of a successful frame.
///
/// Fails with [`QuikError::Terminal`] carrying the peer's `err` text when
/// `status` is false.
pub fn result(frame: &Frame) -> Result<&Value, QuikError> {
    if status(frame) {
        Ok(frame.get("result").unwrap_or(&Value::Null))
    } else {
        let message = err(frame).unwrap_or("unspecified error").to_string();
        Err(QuikError::Terminal(message))
    }
}

// Bit i (counted from the top of 23) marks a digit position in the template
// "YYYY-MM-DDTHH:MM:SS.mmm". Separator positions are not validated.
const DIGIT_MASK: u32 = 0b1111_0110_1101_1011_0110_111;

/// Parses a terminal timestamp string into a packed `YYYYMMDDHHMMSSmmm` time code.
///
/// Accepts exactly two lengths: 19 (`YYYY-MM-DDTHH:MM:SS`, scaled by 1000 so
/// it compares equal to the millisecond form of the same instant) and 23
/// (same plus `.mmm`). Any other length, or a non-digit in a digit position,
/// is a format error.
pub fn parse_timestamp(s: &str) -> Result<u64, QuikError> {
    let bytes = s.as_bytes();
    let len = bytes.len();
    if len != 19 && len != 23 {
        return Err(QuikError::Timestamp(s.to_string()));
    }
    let mut code: u64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if (DIGIT_MASK >> (22 - i)) & 1 == 1 {
            if !b.is_ascii_digit() {
                return Err(QuikError::Timestamp(s.to_string()));
            }
            code = code * 10 + u64::from(b - b'0');
        }
    }
    Ok(if len == 19 { code * 1000 } else { code })
}
