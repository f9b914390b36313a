//! Shared JSON parsing helpers for terminal market data.
//!
//! The terminal's scripting side is loose about number encoding: the same
//! field may arrive as a JSON number or as a numeric string depending on the
//! QLua value it came from. These helpers accept both so the candle and quote
//! decoders do not each reinvent the pattern.

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn as_f64(v: Option<&serde_json::Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `i64`.
///
/// A fractional number is truncated, matching how the terminal reports
/// volumes that are integral in substance but float in encoding.
#[inline]
pub fn as_i64(v: Option<&serde_json::Value>) -> Option<i64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
    }
}

/// Parse a JSON value (string or number) as `u64`.
#[inline]
pub fn as_u64(v: Option<&serde_json::Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_u64()
    }
}

/// Parse a named field on a JSON object as `f64` (string or number).
#[inline]
pub fn f64_field(v: &serde_json::Value, key: &str) -> Option<f64> {
    as_f64(v.get(key))
}

/// Parse a named field on a JSON object as `i64` (string or number).
#[inline]
pub fn i64_field(v: &serde_json::Value, key: &str) -> Option<i64> {
    as_i64(v.get(key))
}
