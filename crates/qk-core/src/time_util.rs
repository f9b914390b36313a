//! Wall-clock helpers.
//!
//! Millisecond-resolution epoch timestamps, used for error-age tracking and
//! the published connected-since value. Monotonic scheduling inside the
//! connection uses `tokio::time::Instant` directly.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
